//! Operator actions. An action never defers: when a precondition does not hold, the
//! reason is reported back through `action-fail` right away.

use snafu::{ResultExt, Snafu};

use super::{refresh, tls, ActionName, AuthSnafu, Charm, ModelSnafu, Result, TlsSnafu};
use crate::{
    charm::{DEFAULT_ADMIN_USERNAME, HIVE_SCHEMA_VERSION, TLS_REL},
    context::Context,
    domain::unit_keys,
    juju::Databag,
    managers::{
        auth::{AuthManager, PASSWORD_LENGTH},
        hive_metastore::is_metastore_valid,
        tls as tls_manager,
    },
    workload::generate_password,
};

/// Why an action refused to run. The message is shown to the operator verbatim.
#[derive(Debug, Snafu)]
pub enum Refusal {
    #[snafu(display("Action must be ran on the application leader"))]
    NotLeader,

    #[snafu(display(
        "The action can only be run when authentication is enabled. \
         Please integrate kyuubi-k8s:auth-db with postgresql-k8s"
    ))]
    AuthenticationDisabled,

    #[snafu(display("The action failed because the workload is not ready yet."))]
    WorkloadNotReady,

    #[snafu(display("The action failed because the charm is not in active state."))]
    NotActive,

    #[snafu(display("Cannot set password while a refresh is blocked ({reason})"))]
    RefreshInProgress { reason: String },

    #[snafu(display(
        "The action failed because the Kubernetes service is not available at the moment."
    ))]
    ServiceUnavailable,

    #[snafu(display("The admin password is not known yet."))]
    PasswordUnknown,

    #[snafu(display("The given private key is invalid: {source}"))]
    InvalidPrivateKey { source: tls_manager::Error },

    #[snafu(display("Cluster is unstable; unit addition/removal ongoing"))]
    UnstableCluster,

    #[snafu(display("Unable to validate metastore"))]
    InvalidMetastore,
}

/// What an action produced: results for `action-set`, or the reason it refused.
type ActionResult = Result<std::result::Result<Databag, Refusal>>;

#[derive(Clone, Copy, Debug)]
enum Precondition {
    Leader,
    Authentication,
    WorkloadReady,
    Active,
}

/// The first precondition that does not hold.
async fn refusal(
    charm: &Charm<'_>,
    context: &Context<'_>,
    preconditions: &[Precondition],
) -> Result<Option<Refusal>> {
    for precondition in preconditions {
        let holds = match precondition {
            Precondition::Leader => charm.is_leader().await?,
            Precondition::Authentication => context
                .is_authentication_enabled()
                .await
                .context(ModelSnafu)?,
            Precondition::WorkloadReady => charm.workload.ready().await,
            Precondition::Active => charm.current_status(context).await.is_active(),
        };
        if !holds {
            return Ok(Some(match precondition {
                Precondition::Leader => Refusal::NotLeader,
                Precondition::Authentication => Refusal::AuthenticationDisabled,
                Precondition::WorkloadReady => Refusal::WorkloadNotReady,
                Precondition::Active => Refusal::NotActive,
            }));
        }
    }
    Ok(None)
}

fn results<const N: usize>(pairs: [(&str, String); N]) -> Databag {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

pub async fn run(charm: &Charm<'_>, context: &Context<'_>, name: ActionName) -> Result<()> {
    tracing::info!(action = %name, "running action");
    let outcome = match name {
        ActionName::GetJdbcEndpoint => get_jdbc_endpoint(charm, context).await?,
        ActionName::GetPassword => get_password(charm, context).await?,
        ActionName::SetPassword => set_password(charm, context).await?,
        ActionName::SetTlsPrivateKey => set_tls_private_key(charm, context).await?,
        ActionName::PreRefreshCheck => pre_refresh_check(charm, context).await?,
        ActionName::ForceRefresh => force_refresh(charm, context).await?,
    };

    match outcome {
        Ok(results) => {
            if !results.is_empty() {
                charm.model.action_set(&results).await.context(ModelSnafu)?;
            }
        }
        Err(refusal) => {
            let message = refusal.to_string();
            tracing::error!(action = %name, %message, "action refused");
            charm
                .model
                .action_set(&results([("error", message.clone())]))
                .await
                .context(ModelSnafu)?;
            charm.model.action_fail(&message).await.context(ModelSnafu)?;
        }
    }
    Ok(())
}

async fn get_jdbc_endpoint(charm: &Charm<'_>, context: &Context<'_>) -> ActionResult {
    use Precondition::*;
    if let Some(refusal) = refusal(charm, context, &[Leader, WorkloadReady, Active]).await? {
        return Ok(Err(refusal));
    }
    let address = charm
        .service_manager()
        .service_address(context.config.expose_external)
        .await;
    if address.is_empty() {
        return Ok(Err(Refusal::ServiceUnavailable));
    }
    Ok(Ok(results([("endpoint", format!("jdbc:hive2://{address}/"))])))
}

async fn get_password(charm: &Charm<'_>, context: &Context<'_>) -> ActionResult {
    use Precondition::*;
    if let Some(refusal) =
        refusal(charm, context, &[Leader, Authentication, WorkloadReady, Active]).await?
    {
        return Ok(Err(refusal));
    }
    let Some(auth_db) = context.auth_db().await.context(ModelSnafu)? else {
        return Ok(Err(Refusal::AuthenticationDisabled));
    };
    let database = charm.databases.connect(&auth_db);
    let password = AuthManager::new(database.as_ref(), charm.model)
        .get_password(DEFAULT_ADMIN_USERNAME)
        .await
        .context(AuthSnafu)?;
    Ok(match password {
        Some(password) => Ok(results([("password", password)])),
        None => Err(Refusal::PasswordUnknown),
    })
}

async fn set_password(charm: &Charm<'_>, context: &Context<'_>) -> ActionResult {
    use Precondition::*;
    if let Some(refusal) =
        refusal(charm, context, &[Leader, Authentication, WorkloadReady, Active]).await?
    {
        return Ok(Err(refusal));
    }
    if let Some(reason) = context.cluster().await.context(ModelSnafu)?.refresh_incompatible {
        return Ok(Err(Refusal::RefreshInProgress { reason }));
    }
    let Some(auth_db) = context.auth_db().await.context(ModelSnafu)? else {
        return Ok(Err(Refusal::AuthenticationDisabled));
    };

    let params = charm.model.action_params().await.context(ModelSnafu)?;
    let password = params
        .get("password")
        .and_then(|password| password.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| generate_password(PASSWORD_LENGTH));

    let database = charm.databases.connect(&auth_db);
    let auth = AuthManager::new(database.as_ref(), charm.model);
    if auth
        .get_password(DEFAULT_ADMIN_USERNAME)
        .await
        .context(AuthSnafu)?
        .as_deref()
        == Some(password.as_str())
    {
        charm
            .model
            .action_log("The old and new passwords are equal.")
            .await
            .context(ModelSnafu)?;
        return Ok(Ok(results([("password", password)])));
    }

    auth.set_password(DEFAULT_ADMIN_USERNAME, &password)
        .await
        .context(AuthSnafu)?;
    Ok(Ok(results([("password", password)])))
}

/// Replaces the key of this unit. Without a `private-key` param a new key is generated.
async fn set_tls_private_key(charm: &Charm<'_>, context: &Context<'_>) -> ActionResult {
    let params = charm.model.action_params().await.context(ModelSnafu)?;
    let private_key = match params.get("private-key").and_then(|key| key.as_str()) {
        Some(key) => match tls_manager::parse_private_key(key) {
            Ok(key) => key,
            Err(source) => return Ok(Err(Refusal::InvalidPrivateKey { source })),
        },
        None => tls_manager::generate_private_key().context(TlsSnafu)?,
    };

    context
        .update_unit_server(&[(unit_keys::PRIVATE_KEY, &private_key)])
        .await
        .context(ModelSnafu)?;

    let tls_enabled = context.cluster().await.context(ModelSnafu)?.tls;
    if tls_enabled && context.relation(TLS_REL).await.context(ModelSnafu)?.is_some() {
        tls::request_certificate(charm, context, Some(private_key)).await?;
    }
    Ok(Ok(Databag::new()))
}

async fn pre_refresh_check(charm: &Charm<'_>, context: &Context<'_>) -> ActionResult {
    if let Some(refusal) = refusal(charm, context, &[Precondition::Leader]).await? {
        return Ok(Err(refusal));
    }

    let planned_units = charm.model.planned_units().await.context(ModelSnafu)?;
    let peer_units = context.peer_units().await.context(ModelSnafu)?;
    if planned_units != peer_units {
        tracing::warn!(planned_units, peer_units, "cluster is scaling");
        return Ok(Err(Refusal::UnstableCluster));
    }
    if planned_units == 1 {
        tracing::warn!("refreshing a single unit leaves no unit serving during the refresh");
    }

    match context.metastore_db().await.context(ModelSnafu)? {
        None => tracing::warn!("no external metastore, refreshing loses the local metastore"),
        Some(metastore) => {
            let database = charm.databases.connect(&metastore);
            if !is_metastore_valid(database.as_ref(), HIVE_SCHEMA_VERSION).await {
                return Ok(Err(Refusal::InvalidMetastore));
            }
        }
    }
    Ok(Ok(results([("result", "Kyuubi is ready to be refreshed".to_string())])))
}

async fn force_refresh(charm: &Charm<'_>, context: &Context<'_>) -> ActionResult {
    if let Some(refusal) = refusal(charm, context, &[Precondition::Leader]).await? {
        return Ok(Err(refusal));
    }
    refresh::force_refresh(charm, context).await?;
    Ok(Ok(results([("result", "Refresh block lifted".to_string())])))
}
