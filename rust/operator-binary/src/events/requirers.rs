//! Relations on which Kyuubi consumes another application: object storage, the
//! integration hub, ZooKeeper and the two PostgreSQL databases.

use snafu::ResultExt;

use super::{AuthSnafu, Charm, HiveMetastoreSnafu, ModelSnafu, Outcome, RelationEventKind, Result};
use crate::{
    charm::{
        AUTHENTICATION_DATABASE_NAME, HA_ZNODE_NAME, HIVE_SCHEMA_VERSION, METASTORE_DATABASE_NAME,
        SERVICE_ACCOUNT_REL,
    },
    context::Context,
    juju::{Bag, Databag, Relation},
    managers::{
        auth::AuthManager,
        hive_metastore::{is_safe_to_initialize, HiveMetastoreManager},
    },
    status::SecretState,
};

/// PostgreSQL role the authentication database user needs to manage `pgcrypto` and
/// to drop the database again.
const AUTH_DB_USER_ROLES: &str = "superuser";

/// Writes a request into our side of `relation`. Only the leader may.
async fn request(charm: &Charm<'_>, relation: &Relation, fields: &[(&str, &str)]) -> Result<()> {
    if !charm.is_leader().await? {
        return Ok(());
    }
    tracing::info!(%relation, ?fields, "requesting from provider");
    let data = fields
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect::<Databag>();
    charm
        .model
        .write(relation, &Bag::LocalApp, &data)
        .await
        .context(ModelSnafu)
}

pub async fn on_s3(
    charm: &Charm<'_>,
    context: &Context<'_>,
    kind: RelationEventKind,
) -> Result<Outcome> {
    match kind {
        RelationEventKind::Changed | RelationEventKind::Broken => {
            charm.refresh_workload(context).await
        }
        _ => Ok(Outcome::Done),
    }
}

/// Asks the integration hub for the configured service account, as `namespace:name`.
pub async fn request_service_account(charm: &Charm<'_>, context: &Context<'_>) -> Result<()> {
    let Some(relation) = context
        .relation(SERVICE_ACCOUNT_REL)
        .await
        .context(ModelSnafu)?
    else {
        return Ok(());
    };
    let account = format!(
        "{namespace}:{name}",
        namespace = context.namespace(),
        name = context.config.service_account
    );
    request(charm, &relation, &[("service-account", &account)]).await
}

pub async fn on_service_account(
    charm: &Charm<'_>,
    context: &Context<'_>,
    kind: RelationEventKind,
    _relation: &Relation,
) -> Result<Outcome> {
    match kind {
        RelationEventKind::Created => {
            request_service_account(charm, context).await?;
            Ok(Outcome::Done)
        }
        RelationEventKind::Changed | RelationEventKind::Broken => {
            charm.refresh_workload(context).await
        }
        _ => Ok(Outcome::Done),
    }
}

pub async fn on_zookeeper(
    charm: &Charm<'_>,
    context: &Context<'_>,
    kind: RelationEventKind,
    relation: &Relation,
) -> Result<Outcome> {
    match kind {
        RelationEventKind::Created => {
            request(charm, relation, &[("database", HA_ZNODE_NAME)]).await?;
            Ok(Outcome::Done)
        }
        RelationEventKind::Changed | RelationEventKind::Broken => {
            charm.refresh_workload(context).await
        }
        _ => Ok(Outcome::Done),
    }
}

pub async fn on_metastore_db(
    charm: &Charm<'_>,
    context: &Context<'_>,
    kind: RelationEventKind,
    relation: &Relation,
) -> Result<Outcome> {
    match kind {
        RelationEventKind::Created => {
            request(charm, relation, &[("database", METASTORE_DATABASE_NAME)]).await?;
            Ok(Outcome::Done)
        }
        RelationEventKind::Changed => {
            if charm.refresh_workload(context).await? == Outcome::Defer {
                return Ok(Outcome::Defer);
            }
            if !charm.is_leader().await? {
                return Ok(Outcome::Done);
            }
            let Some(metastore) = context.metastore_db().await.context(ModelSnafu)? else {
                tracing::debug!("metastore credentials not published yet");
                return Ok(Outcome::Done);
            };
            let database = charm.databases.connect(&metastore);
            if is_safe_to_initialize(database.as_ref()).await {
                HiveMetastoreManager::new(charm.workload)
                    .initialize_schema(HIVE_SCHEMA_VERSION)
                    .await
                    .context(HiveMetastoreSnafu)?;
            } else {
                tracing::info!("metastore already holds tables, skipping schema initialization");
            }
            Ok(Outcome::Done)
        }
        RelationEventKind::Broken => charm.refresh_workload(context).await,
        _ => Ok(Outcome::Done),
    }
}

pub async fn on_auth_db(
    charm: &Charm<'_>,
    context: &Context<'_>,
    kind: RelationEventKind,
    relation: &Relation,
) -> Result<Outcome> {
    match kind {
        RelationEventKind::Created => {
            request(
                charm,
                relation,
                &[
                    ("database", AUTHENTICATION_DATABASE_NAME),
                    ("extra-user-roles", AUTH_DB_USER_ROLES),
                ],
            )
            .await?;
            Ok(Outcome::Done)
        }
        RelationEventKind::Changed => {
            if !charm.workload.ready().await {
                return Ok(Outcome::Defer);
            }
            if charm.is_leader().await? {
                if let Some(auth_db) = context.auth_db().await.context(ModelSnafu)? {
                    let admin_password = match context
                        .system_users_secret()
                        .await
                        .context(ModelSnafu)?
                    {
                        SecretState::Valid(password) => Some(password),
                        _ => None,
                    };
                    let database = charm.databases.connect(&auth_db);
                    AuthManager::new(database.as_ref(), charm.model)
                        .prepare(admin_password)
                        .await
                        .context(AuthSnafu)?;
                }
            }
            charm.refresh_workload(context).await
        }
        RelationEventKind::Broken => {
            if charm.is_leader().await? {
                // the context of a broken hook no longer sees the relation
                let departing = charm.context().await?;
                if let Some(auth_db) = departing.auth_db().await.context(ModelSnafu)? {
                    let database = charm.databases.connect(&auth_db);
                    AuthManager::new(database.as_ref(), charm.model)
                        .remove_auth_db(&auth_db.dbname)
                        .await;
                }
            }
            charm.refresh_workload(context).await
        }
        _ => Ok(Outcome::Done),
    }
}
