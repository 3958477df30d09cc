//! The `jdbc` relation: Kyuubi as a database provider for client applications.

use futures::future::try_join_all;
use snafu::ResultExt;

use super::{AuthSnafu, Charm, ModelSnafu, Outcome, RelationEventKind, Result};
use crate::{
    context::Context,
    juju::{Bag, Databag, Relation},
    managers::{
        auth::{relation_username, AuthManager, PASSWORD_LENGTH},
        service::Endpoint,
    },
    workload::generate_password,
};

pub async fn on_relation(
    charm: &Charm<'_>,
    context: &Context<'_>,
    kind: RelationEventKind,
    relation: &Relation,
) -> Result<Outcome> {
    match kind {
        RelationEventKind::Changed => on_database_requested(charm, context, relation).await,
        RelationEventKind::Broken => on_broken(charm, context, relation).await,
        _ => Ok(Outcome::Done),
    }
}

/// Connection details every client sees, regardless of its credentials.
async fn endpoint_data(
    charm: &Charm<'_>,
    context: &Context<'_>,
    endpoint: &Endpoint,
) -> Result<Databag> {
    let server = context.unit_server().await.context(ModelSnafu)?;
    let tls = context.cluster().await.context(ModelSnafu)?.tls;
    let tls_ca = server.ca_cert.filter(|_| tls).unwrap_or_default();
    let version = charm.workload.kyuubi_version().await.unwrap_or_default();

    Ok(Databag::from([
        ("endpoints".to_string(), endpoint.to_string()),
        ("uris".to_string(), endpoint.jdbc_uri()),
        ("version".to_string(), version),
        (
            "tls".to_string(),
            if tls { "True" } else { "False" }.to_string(),
        ),
        ("tls-ca".to_string(), tls_ca),
    ]))
}

async fn on_database_requested(
    charm: &Charm<'_>,
    context: &Context<'_>,
    relation: &Relation,
) -> Result<Outcome> {
    if !charm.is_leader().await? {
        return Ok(Outcome::Done);
    }
    let requested = charm
        .model
        .read(relation, &Bag::RemoteApp)
        .await
        .context(ModelSnafu)?
        .remove("database")
        .filter(|database| !database.is_empty());
    let Some(database) = requested else {
        tracing::debug!(%relation, "client has not requested a database yet");
        return Ok(Outcome::Done);
    };

    let Some(auth_db) = context.auth_db().await.context(ModelSnafu)? else {
        tracing::warn!(%relation, "authentication not enabled, deferring the client request");
        return Ok(Outcome::Defer);
    };
    if !charm.workload.ready().await {
        return Ok(Outcome::Defer);
    }
    let expose = context.config.expose_external;
    let Some(endpoint) = charm.service_manager().get_service_endpoint(expose).await else {
        tracing::info!(%relation, %expose, "service endpoint not available yet, deferring");
        return Ok(Outcome::Defer);
    };

    let username = relation_username(relation.id);
    let executor = charm.databases.connect(&auth_db);
    let auth = AuthManager::new(executor.as_ref(), charm.model);
    let password = match auth.get_password(&username).await.context(AuthSnafu)? {
        Some(password) if auth.user_exists(&username).await => password,
        _ => {
            let password = generate_password(PASSWORD_LENGTH);
            if auth.user_exists(&username).await {
                auth.set_password(&username, &password)
                    .await
                    .context(AuthSnafu)?;
            } else {
                auth.create_user(&username, &password)
                    .await
                    .context(AuthSnafu)?;
            }
            password
        }
    };

    let mut data = endpoint_data(charm, context, &endpoint).await?;
    data.extend([
        ("username".to_string(), username),
        ("password".to_string(), password),
        ("database".to_string(), database),
    ]);
    charm
        .model
        .write(relation, &Bag::LocalApp, &data)
        .await
        .context(ModelSnafu)?;
    tracing::info!(%relation, "published credentials to client");
    Ok(Outcome::Done)
}

async fn on_broken(
    charm: &Charm<'_>,
    context: &Context<'_>,
    relation: &Relation,
) -> Result<Outcome> {
    if !charm.is_leader().await? {
        return Ok(Outcome::Done);
    }
    let Some(auth_db) = context.auth_db().await.context(ModelSnafu)? else {
        return Ok(Outcome::Done);
    };
    let executor = charm.databases.connect(&auth_db);
    AuthManager::new(executor.as_ref(), charm.model)
        .delete_user(&relation_username(relation.id))
        .await
        .context(AuthSnafu)?;
    Ok(Outcome::Done)
}

/// Republishes the endpoint and TLS details to every client after either changed.
pub async fn update_clients_endpoints(charm: &Charm<'_>, context: &Context<'_>) -> Result<()> {
    let relations = context.client_relations().await.context(ModelSnafu)?;
    if relations.is_empty() {
        return Ok(());
    }
    let expose = context.config.expose_external;
    let Some(endpoint) = charm.service_manager().get_service_endpoint(expose).await else {
        tracing::debug!("service endpoint not available, keeping client data");
        return Ok(());
    };
    let data = endpoint_data(charm, context, &endpoint).await?;

    try_join_all(relations.iter().map(|relation| {
        tracing::debug!(%relation, %endpoint, "updating client endpoint");
        charm.model.write(relation, &Bag::LocalApp, &data)
    }))
    .await
    .context(ModelSnafu)?;
    Ok(())
}
