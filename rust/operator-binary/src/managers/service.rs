//! The Kubernetes Service exposing Kyuubi's JDBC port, and the address clients reach it on.

use std::{collections::BTreeMap, fmt, net::IpAddr, time::Duration};

use snafu::{ResultExt, Snafu};
use stackable_operator::k8s_openapi::{
    api::core::v1::{Node, Service, ServicePort, ServiceSpec},
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};

use crate::{
    charm::{ExposeExternal, JDBC_PORT, JDBC_PORT_NAME},
    managers::k8s::{self, ClusterApi},
};

const APP_NAME_LABEL: &str = "app.kubernetes.io/name";
const DELETION_TIMEOUT: Duration = Duration::from_secs(30);
const DELETION_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to look up the exposing service"))]
    GetService { source: k8s::Error },

    #[snafu(display("failed to delete the exposing service"))]
    DeleteService { source: k8s::Error },

    #[snafu(display("failed to create the exposing service"))]
    CreateService { source: k8s::Error },

    #[snafu(display("failed to look up the owner pod"))]
    GetOwnerPod { source: k8s::Error },

    #[snafu(display("service {service} is still terminating"))]
    ServiceTerminating { service: String },
}

impl Error {
    /// Whether the same reconcile can succeed once the previous service is gone.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ServiceTerminating { .. }
                | Error::CreateService {
                    source: k8s::Error::AlreadyExists { .. }
                }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where clients connect to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether the host is an IP address rather than a DNS name.
    pub fn is_ip(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    pub fn jdbc_uri(&self) -> String {
        format!("jdbc:hive2://{self}/")
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Preferred address of a node: ExternalIP, then InternalIP, then Hostname.
pub fn node_address(node: &Node) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    ["ExternalIP", "InternalIP", "Hostname"]
        .iter()
        .find_map(|kind| {
            addresses
                .iter()
                .find(|address| address.type_ == *kind)
                .map(|address| address.address.clone())
        })
}

fn service_type(service: &Service) -> Option<&str> {
    service.spec.as_ref()?.type_.as_deref()
}

pub struct ServiceManager<'a> {
    api: &'a dyn ClusterApi,
    namespace: &'a str,
    app_name: &'a str,
    pod_name: String,
    deletion_timeout: Duration,
}

impl<'a> ServiceManager<'a> {
    pub fn new(
        api: &'a dyn ClusterApi,
        namespace: &'a str,
        app_name: &'a str,
        pod_name: String,
    ) -> Self {
        Self {
            api,
            namespace,
            app_name,
            pod_name,
            deletion_timeout: DELETION_TIMEOUT,
        }
    }

    pub fn service_name(&self) -> String {
        format!("{}-service", self.app_name)
    }

    /// Cluster internal DNS name of the service.
    pub fn internal_host(&self) -> String {
        format!(
            "{service}.{namespace}.svc.cluster.local",
            service = self.service_name(),
            namespace = self.namespace
        )
    }

    pub fn build_service(
        &self,
        expose: ExposeExternal,
        annotations: BTreeMap<String, String>,
        owner: ObjectMeta,
    ) -> Service {
        let labels = BTreeMap::from([(APP_NAME_LABEL.to_string(), self.app_name.to_string())]);
        Service {
            metadata: ObjectMeta {
                name: Some(self.service_name()),
                namespace: Some(self.namespace.to_string()),
                owner_references: owner.owner_references,
                labels: Some(labels.clone()),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(expose.service_type().to_string()),
                ports: Some(vec![ServicePort {
                    name: Some(JDBC_PORT_NAME.to_string()),
                    port: JDBC_PORT.into(),
                    target_port: Some(IntOrString::Int(JDBC_PORT.into())),
                    ..ServicePort::default()
                }]),
                selector: Some(labels),
                ..ServiceSpec::default()
            }),
            status: None,
        }
    }

    /// Makes the live service match `expose` and `annotations`. The type of a service
    /// cannot be changed in place, so a mismatching service is deleted and recreated.
    ///
    /// Returns whether anything was changed.
    pub async fn reconcile(
        &self,
        expose: ExposeExternal,
        annotations: BTreeMap<String, String>,
    ) -> Result<bool> {
        let name = self.service_name();
        let existing = self
            .api
            .get_service(self.namespace, &name)
            .await
            .context(GetServiceSnafu)?;

        if let Some(existing) = existing {
            let same_type = service_type(&existing) == Some(expose.service_type());
            let same_annotations =
                existing.metadata.annotations.clone().unwrap_or_default() == annotations;
            if same_type && same_annotations {
                tracing::debug!(service = %name, %expose, "service already up to date");
                return Ok(false);
            }

            tracing::info!(
                service = %name,
                from = service_type(&existing).unwrap_or_default(),
                to = expose.service_type(),
                "replacing service"
            );
            self.api
                .delete_service(self.namespace, &name)
                .await
                .context(DeleteServiceSnafu)?;
            self.wait_for_deletion(&name).await?;
        }

        // the service lives as long as the StatefulSet owning the first pod
        let owner = self
            .api
            .get_pod(self.namespace, &format!("{}-0", self.app_name))
            .await
            .context(GetOwnerPodSnafu)?
            .map(|pod| pod.metadata)
            .unwrap_or_default();

        let service = self.build_service(expose, annotations, owner);
        self.api
            .create_service(self.namespace, &service)
            .await
            .context(CreateServiceSnafu)?;
        tracing::info!(service = %name, service_type = expose.service_type(), "created service");
        Ok(true)
    }

    /// Finalizers, e.g. of a cloud load balancer, keep a deleted service around for a while.
    async fn wait_for_deletion(&self, name: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.deletion_timeout;
        loop {
            let existing = self
                .api
                .get_service(self.namespace, name)
                .await
                .context(GetServiceSnafu)?;
            if existing.is_none() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return ServiceTerminatingSnafu { service: name }.fail();
            }
            tracing::debug!(service = name, "waiting for the previous service to go away");
            tokio::time::sleep(DELETION_POLL_INTERVAL).await;
        }
    }

    /// Address of the node the unit's pod is scheduled on.
    pub async fn node_ip(&self) -> Option<String> {
        let pod = match self.api.get_pod(self.namespace, &self.pod_name).await {
            Ok(pod) => pod?,
            Err(error) => {
                tracing::warn!(%error, "unable to look up unit pod");
                return None;
            }
        };
        let node_name = pod.spec?.node_name?;
        match self.api.get_node(&node_name).await {
            Ok(node) => node.as_ref().and_then(node_address),
            Err(error) => {
                tracing::warn!(%error, node = %node_name, "unable to look up node");
                None
            }
        }
    }

    /// Endpoint clients should use, or `None` while the service is missing, has a
    /// different type than requested, or waits for a load balancer.
    pub async fn get_service_endpoint(&self, expose: ExposeExternal) -> Option<Endpoint> {
        let service = match self.api.get_service(self.namespace, &self.service_name()).await {
            Ok(service) => service?,
            Err(error) => {
                tracing::warn!(%error, "unable to look up service");
                return None;
            }
        };

        if service_type(&service) != Some(expose.service_type()) {
            tracing::debug!(
                expected = expose.service_type(),
                found = ?service_type(&service),
                "service type does not match yet"
            );
            return None;
        }

        match expose {
            ExposeExternal::False => Some(Endpoint::new(self.internal_host(), JDBC_PORT)),
            ExposeExternal::NodePort => {
                let node_port = service
                    .spec
                    .as_ref()?
                    .ports
                    .as_ref()?
                    .iter()
                    .find_map(|port| port.node_port)?;
                let host = self.node_ip().await?;
                Some(Endpoint::new(host, node_port.try_into().ok()?))
            }
            ExposeExternal::LoadBalancer => {
                let ingress = service.status.as_ref()?.load_balancer.as_ref()?.ingress.as_ref()?;
                ingress.iter().find_map(|ingress| {
                    ingress
                        .ip
                        .clone()
                        .or_else(|| ingress.hostname.clone())
                        .map(|host| Endpoint::new(host, JDBC_PORT))
                })
            }
        }
    }

    /// `host:port` of [`Self::get_service_endpoint`], empty when it is not available yet.
    pub async fn service_address(&self, expose: ExposeExternal) -> String {
        self.get_service_endpoint(expose)
            .await
            .map(|endpoint| endpoint.to_string())
            .unwrap_or_default()
    }
}
