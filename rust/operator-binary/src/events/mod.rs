//! Turning one Juju dispatch into handler calls.
//!
//! Every dispatch first replays the events deferred by earlier dispatches, then handles
//! the current one and finally derives and publishes the unit status from scratch.

pub mod actions;
pub mod lifecycle;
pub mod provider;
pub mod refresh;
pub mod requirers;
pub mod tls;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{Display, EnumString};

use crate::{
    charm::{
        self, CharmConfig, AUTH_DB_REL, CLIENT_REL, HIVE_SCHEMA_VERSION, METASTORE_DB_REL,
        PEER_REL, S3_REL, SERVICE_ACCOUNT_REL, TLS_REL, ZOOKEEPER_REL,
    },
    context::Context,
    juju::{self, deferred::DeferredQueue, Model, Relation, StatusTarget},
    managers::{
        auth,
        database::DatabaseConnector,
        hive_metastore::{self, is_metastore_valid},
        k8s::{ClusterApi, K8sManager, Lookup},
        kyuubi::{self, KyuubiManager, UpdateOptions, UpdateOutcome},
        s3::ObjectStorageVerifier,
        service::{self, ServiceManager},
        tls as tls_manager,
    },
    status::{derive_status, CharmStatus, SecretState, StatusProbes},
    workload::{self, Workload},
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("unsupported dispatch path {path:?}"))]
    InvalidDispatchPath { path: String },

    #[snafu(display("hook {hook} was dispatched without JUJU_RELATION_ID"))]
    MissingRelationId { hook: String },

    #[snafu(display("failed to parse the relation of hook {hook}"))]
    ParseRelation { source: juju::Error, hook: String },

    #[snafu(display("failed to access the Juju model"))]
    Model { source: juju::Error },

    #[snafu(display("invalid charm configuration"))]
    ParseConfig { source: charm::Error },

    #[snafu(display("failed to reconcile Kyuubi"))]
    Update { source: kyuubi::Error },

    #[snafu(display("failed to reconcile the Kubernetes service"))]
    Service { source: service::Error },

    #[snafu(display("failed to manage authentication users"))]
    Auth { source: auth::Error },

    #[snafu(display("failed to manage TLS material"))]
    Tls { source: tls_manager::Error },

    #[snafu(display("failed to initialize the Hive metastore"))]
    HiveMetastore { source: hive_metastore::Error },

    #[snafu(display("failed to run a command in the workload"))]
    Workload { source: workload::Error },

    #[snafu(display("failed to serialize relation data"))]
    SerializeRelationData { source: serde_json::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RelationEventKind {
    Created,
    Joined,
    Changed,
    Departed,
    Broken,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ActionName {
    GetJdbcEndpoint,
    GetPassword,
    SetPassword,
    SetTlsPrivateKey,
    PreRefreshCheck,
    ForceRefresh,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Event {
    Install,
    ConfigChanged,
    LeaderElected,
    UpdateStatus,
    UpgradeCharm,
    PebbleReady,
    Relation {
        kind: RelationEventKind,
        relation: Relation,
    },
    Action(ActionName),
    /// A hook this charm does not react to beyond recomputing its status.
    Unknown(String),
}

impl Event {
    /// Parses `JUJU_DISPATCH_PATH`, e.g. `hooks/certificates-relation-changed` or
    /// `actions/get-password`, with the relation context Juju passes alongside.
    pub fn from_dispatch(
        path: &str,
        relation_id: Option<&str>,
        remote_app: Option<&str>,
    ) -> Result<Self> {
        if let Some(action) = path.strip_prefix("actions/") {
            return Ok(match action.parse() {
                Ok(name) => Event::Action(name),
                Err(_) => Event::Unknown(action.to_string()),
            });
        }

        let hook = path
            .strip_prefix("hooks/")
            .context(InvalidDispatchPathSnafu { path })?;
        let event = match hook {
            "install" => Event::Install,
            "config-changed" => Event::ConfigChanged,
            "leader-elected" => Event::LeaderElected,
            "update-status" => Event::UpdateStatus,
            "upgrade-charm" => Event::UpgradeCharm,
            hook if hook.ends_with("-pebble-ready") => Event::PebbleReady,
            hook => match hook
                .rsplit_once("-relation-")
                .and_then(|(endpoint, kind)| {
                    Some((endpoint, kind.parse::<RelationEventKind>().ok()?))
                })
            {
                Some((endpoint, kind)) => {
                    let relation_id = relation_id
                        .filter(|id| !id.is_empty())
                        .context(MissingRelationIdSnafu { hook })?;
                    let mut relation = relation_id
                        .parse::<Relation>()
                        .context(ParseRelationSnafu { hook })?;
                    if relation.endpoint != endpoint {
                        tracing::warn!(
                            %relation,
                            endpoint,
                            "relation id does not match the hook name"
                        );
                    }
                    if let Some(remote_app) = remote_app.filter(|app| !app.is_empty()) {
                        relation = relation.with_remote_app(remote_app);
                    }
                    Event::Relation { kind, relation }
                }
                None => Event::Unknown(hook.to_string()),
            },
        };
        Ok(event)
    }

    /// Actions report to the operator directly and are never replayed.
    fn is_deferrable(&self) -> bool {
        !matches!(self, Event::Action(_) | Event::Unknown(_))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Done,
    /// Re-deliver the event at the start of the next dispatch.
    Defer,
}

/// Everything a handler talks to.
pub struct Charm<'a> {
    pub model: &'a dyn Model,
    pub workload: &'a dyn Workload,
    pub cluster_api: &'a dyn ClusterApi,
    pub databases: &'a dyn DatabaseConnector,
    pub object_storage: &'a dyn ObjectStorageVerifier,
}

impl<'a> Charm<'a> {
    pub async fn context(&self) -> Result<Context<'a>> {
        let config = self.model.config().await.context(ModelSnafu)?;
        let config = CharmConfig::from_json(config).context(ParseConfigSnafu)?;
        Ok(Context::new(self.model, config))
    }

    /// The context an event is handled in. A `-relation-broken` hook must not see the
    /// relation that is going away.
    async fn context_for(&self, event: &Event) -> Result<Context<'a>> {
        let context = self.context().await?;
        Ok(match event {
            Event::Relation {
                kind: RelationEventKind::Broken,
                relation,
            } => context.without(relation.clone()),
            _ => context,
        })
    }

    pub async fn is_leader(&self) -> Result<bool> {
        self.model.is_leader().await.context(ModelSnafu)
    }

    /// The Service exposing this application, which lives in the model's namespace.
    pub fn service_manager(&self) -> ServiceManager<'a> {
        ServiceManager::new(
            self.cluster_api,
            self.model.model_name(),
            self.model.app_name(),
            self.model.pod_name(),
        )
    }

    /// Renders the configuration from the current model state and restarts Kyuubi if
    /// anything changed.
    pub async fn update(
        &self,
        context: &Context<'_>,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome> {
        let inputs = context
            .kyuubi_inputs(self.cluster_api.api_server())
            .await
            .context(ModelSnafu)?;
        KyuubiManager::new(self.workload)
            .update(&inputs, options)
            .await
            .context(UpdateSnafu)
    }

    /// [`Self::update`], deferred while the workload container cannot be reached.
    pub async fn refresh_workload(&self, context: &Context<'_>) -> Result<Outcome> {
        if !self.workload.ready().await {
            tracing::info!("workload container not ready yet, deferring");
            return Ok(Outcome::Defer);
        }
        self.update(context, UpdateOptions::default()).await?;
        Ok(Outcome::Done)
    }

    pub async fn handle(&self, event: &Event) -> Result<Outcome> {
        let context = self.context_for(event).await?;
        tracing::info!(?event, "handling event");
        match event {
            Event::Install => lifecycle::on_install(self, &context).await,
            Event::ConfigChanged => lifecycle::on_config_changed(self, &context).await,
            Event::LeaderElected => lifecycle::on_leader_elected(self, &context).await,
            Event::UpdateStatus => lifecycle::on_update_status(self, &context).await,
            Event::UpgradeCharm => refresh::on_upgrade_charm(self, &context).await,
            Event::PebbleReady => lifecycle::on_pebble_ready(self, &context).await,
            Event::Relation { kind, relation } => {
                let kind = *kind;
                match relation.endpoint.as_str() {
                    PEER_REL => lifecycle::on_peer_relation(self, &context, kind).await,
                    TLS_REL => tls::on_relation(self, &context, kind, relation).await,
                    CLIENT_REL => provider::on_relation(self, &context, kind, relation).await,
                    AUTH_DB_REL => requirers::on_auth_db(self, &context, kind, relation).await,
                    METASTORE_DB_REL => {
                        requirers::on_metastore_db(self, &context, kind, relation).await
                    }
                    S3_REL => requirers::on_s3(self, &context, kind).await,
                    SERVICE_ACCOUNT_REL => {
                        requirers::on_service_account(self, &context, kind, relation).await
                    }
                    ZOOKEEPER_REL => {
                        requirers::on_zookeeper(self, &context, kind, relation).await
                    }
                    endpoint => {
                        tracing::debug!(endpoint, "ignoring event of unknown relation");
                        Ok(Outcome::Done)
                    }
                }
            }
            Event::Action(name) => {
                actions::run(self, &context, *name).await?;
                Ok(Outcome::Done)
            }
            Event::Unknown(name) => {
                tracing::debug!(name, "no handler registered");
                Ok(Outcome::Done)
            }
        }
    }

    /// Replays deferred events, handles `event` and publishes the resulting status.
    pub async fn dispatch(&self, event: Event, queue: &mut DeferredQueue) -> Result<CharmStatus> {
        for deferred in queue.drain() {
            tracing::info!(event = ?deferred, "re-emitting deferred event");
            match self.handle(&deferred).await {
                Ok(Outcome::Done) => {}
                Ok(Outcome::Defer) => queue.push(deferred),
                Err(error) => {
                    tracing::warn!(%error, event = ?deferred, "deferred event failed, keeping it");
                    queue.push(deferred);
                }
            }
        }

        if self.handle(&event).await? == Outcome::Defer && event.is_deferrable() {
            tracing::info!(?event, "deferring event");
            queue.push(event.clone());
        }

        let context = self.context_for(&event).await?;
        self.apply_status(&context).await
    }

    pub async fn current_status(&self, context: &Context<'_>) -> CharmStatus {
        derive_status(&StatusView {
            charm: self,
            context,
        })
        .await
    }

    /// Derives the status and sets it on the unit, and on the application when leading.
    pub async fn apply_status(&self, context: &Context<'_>) -> Result<CharmStatus> {
        let status = self.current_status(context).await;
        tracing::info!(%status, severity = %status.severity(), "computed status");

        self.model
            .set_status(StatusTarget::Unit, &status)
            .await
            .context(ModelSnafu)?;
        if self.is_leader().await? {
            self.model
                .set_status(StatusTarget::Application, &status)
                .await
                .context(ModelSnafu)?;
        }

        if self.workload.ready().await {
            if let Some(version) = self.workload.kyuubi_version().await {
                self.model
                    .set_workload_version(&version)
                    .await
                    .context(ModelSnafu)?;
            }
        }
        Ok(status)
    }
}

/// Logs a failed model read and carries on with `fallback`.
fn observed<T>(result: juju::Result<T>, what: &str, fallback: T) -> T {
    result.unwrap_or_else(|error| {
        tracing::warn!(%error, what, "unable to observe, assuming the worst");
        fallback
    })
}

struct StatusView<'c, 'a> {
    charm: &'c Charm<'a>,
    context: &'c Context<'a>,
}

impl StatusView<'_, '_> {
    async fn k8s_lookup(&self, service_account: bool) -> Lookup {
        let Some(info) = observed(self.context.service_account().await, "service account", None)
        else {
            return Lookup::Missing;
        };
        let manager = K8sManager::new(
            self.charm.cluster_api,
            &info.namespace,
            &info.service_account,
        );
        if service_account {
            manager.service_account().await
        } else {
            manager.namespace().await
        }
    }
}

#[async_trait]
impl StatusProbes for StatusView<'_, '_> {
    async fn workload_ready(&self) -> bool {
        self.charm.workload.ready().await
    }

    async fn s3_present(&self) -> bool {
        observed(self.context.s3().await.map(|s3| s3.is_some()), "s3", false)
    }

    async fn s3_credentials_valid(&self) -> bool {
        match observed(self.context.s3().await, "s3", None) {
            Some(s3) => self.charm.object_storage.verify(&s3).await,
            None => false,
        }
    }

    async fn service_account_present(&self) -> bool {
        observed(
            self.context.service_account().await.map(|info| info.is_some()),
            "service account",
            false,
        )
    }

    async fn namespace(&self) -> Lookup {
        self.k8s_lookup(false).await
    }

    async fn service_account(&self) -> Lookup {
        self.k8s_lookup(true).await
    }

    async fn system_users_secret(&self) -> SecretState {
        observed(
            self.context.system_users_secret().await,
            "system-users",
            SecretState::DoesNotExist,
        )
    }

    async fn tls_secret(&self) -> SecretState {
        observed(
            self.context.tls_secret().await,
            "tls-client-private-key",
            SecretState::DoesNotExist,
        )
    }

    async fn zookeeper_relation_exists(&self) -> bool {
        observed(self.context.zookeeper_relation_exists().await, "zookeeper", false)
    }

    async fn zookeeper_present(&self) -> bool {
        observed(
            self.context.zookeeper().await.map(|zookeeper| zookeeper.is_some()),
            "zookeeper",
            false,
        )
    }

    async fn planned_units(&self) -> u32 {
        observed(self.charm.model.planned_units().await, "planned units", 1)
    }

    async fn metastore_valid(&self) -> Option<bool> {
        let metastore = observed(self.context.metastore_db().await, "metastore", None)?;
        let database = self.charm.databases.connect(&metastore);
        Some(is_metastore_valid(database.as_ref(), HIVE_SCHEMA_VERSION).await)
    }

    async fn refresh_incompatible(&self) -> Option<String> {
        observed(self.context.cluster().await, "peer data", Default::default())
            .refresh_incompatible
    }

    async fn service_address(&self) -> String {
        self.charm
            .service_manager()
            .service_address(self.context.config.expose_external)
            .await
    }

    async fn serving_requests(&self) -> bool {
        self.charm.workload.serving_requests().await
    }
}
