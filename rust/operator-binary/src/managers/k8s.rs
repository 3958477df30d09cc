//! Kubernetes objects Kyuubi depends on but does not own.

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::{Namespace, Node, Pod, Service, ServiceAccount},
    kube::{
        self,
        api::{DeleteParams, PostParams},
        core::ErrorResponse,
    },
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to infer the Kubernetes client configuration"))]
    InferConfig {
        source: kube::config::InferConfigError,
    },

    #[snafu(display("failed to create the Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("access to {resource} is forbidden"))]
    Forbidden { resource: String },

    #[snafu(display("{resource} already exists"))]
    AlreadyExists { resource: String },

    #[snafu(display("failed to {verb} {resource}"))]
    KubeApi {
        source: kube::Error,
        verb: &'static str,
        resource: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Error::Forbidden { .. })
    }
}

/// The subset of the Kubernetes API the charm talks to.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Address of the API server, as used in `spark.master`.
    fn api_server(&self) -> String;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>>;
}

/// Splits 403 and 409 responses off so that callers can report missing permissions and
/// retry conflicts.
fn api_error(error: kube::Error, verb: &'static str, resource: String) -> Error {
    match error {
        kube::Error::Api(ErrorResponse { code: 403, .. }) => Error::Forbidden { resource },
        kube::Error::Api(ErrorResponse { code: 409, .. }) => Error::AlreadyExists { resource },
        source => Error::KubeApi {
            source,
            verb,
            resource,
        },
    }
}

/// [`ClusterApi`] backed by the in-cluster kube-rs client.
pub struct KubeClient {
    client: kube::Client,
    api_server: String,
}

impl KubeClient {
    pub async fn new() -> Result<Self> {
        let config = kube::Config::infer().await.context(InferConfigSnafu)?;
        let api_server = config.cluster_url.to_string();
        let client = kube::Client::try_from(config).context(CreateClientSnafu)?;
        Ok(Self {
            client,
            api_server: api_server.trim_end_matches('/').to_string(),
        })
    }

    fn namespaced<K>(&self, namespace: &str) -> kube::Api<K>
    where
        K: kube::Resource<Scope = stackable_operator::k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        kube::Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    fn api_server(&self) -> String {
        self.api_server.clone()
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.namespaced::<Service>(namespace)
            .get_opt(name)
            .await
            .map_err(|error| api_error(error, "get", format!("service {namespace}/{name}")))
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.namespaced::<Service>(namespace)
            .create(&PostParams::default(), service)
            .await
            .map_err(|error| api_error(error, "create", format!("service {namespace}/{name}")))?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        self.namespaced::<Service>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|error| api_error(error, "delete", format!("service {namespace}/{name}")))?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.namespaced::<Pod>(namespace)
            .get_opt(name)
            .await
            .map_err(|error| api_error(error, "get", format!("pod {namespace}/{name}")))
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        kube::Api::<Node>::all(self.client.clone())
            .get_opt(name)
            .await
            .map_err(|error| api_error(error, "get", format!("node {name}")))
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        kube::Api::<Namespace>::all(self.client.clone())
            .get_opt(name)
            .await
            .map_err(|error| api_error(error, "get", format!("namespace {name}")))
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        self.namespaced::<ServiceAccount>(namespace)
            .get_opt(name)
            .await
            .map_err(|error| {
                api_error(error, "get", format!("serviceaccount {namespace}/{name}"))
            })
    }
}

/// Outcome of looking up an object the charm was told to use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lookup {
    Found,
    Missing,
    Forbidden,
}

impl<T> From<Result<Option<T>>> for Lookup {
    fn from(result: Result<Option<T>>) -> Self {
        match result {
            Ok(Some(_)) => Lookup::Found,
            Ok(None) => Lookup::Missing,
            Err(error) if error.is_forbidden() => Lookup::Forbidden,
            Err(error) => {
                tracing::warn!(%error, "treating failed lookup as missing");
                Lookup::Missing
            }
        }
    }
}

/// Checks the namespace and service account Spark engines are submitted with.
pub struct K8sManager<'a> {
    api: &'a dyn ClusterApi,
    namespace: &'a str,
    service_account: &'a str,
}

impl<'a> K8sManager<'a> {
    pub fn new(api: &'a dyn ClusterApi, namespace: &'a str, service_account: &'a str) -> Self {
        Self {
            api,
            namespace,
            service_account,
        }
    }

    pub async fn namespace(&self) -> Lookup {
        self.api.get_namespace(self.namespace).await.into()
    }

    pub async fn service_account(&self) -> Lookup {
        self.api
            .get_service_account(self.namespace, self.service_account)
            .await
            .into()
    }

    pub async fn is_namespace_valid(&self) -> bool {
        self.namespace().await == Lookup::Found
    }

    pub async fn is_service_account_valid(&self) -> bool {
        self.service_account().await == Lookup::Found
    }
}
