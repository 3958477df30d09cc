//! Handlers of the charm's own lifecycle hooks and of the peer relation.

use snafu::ResultExt;

use super::{
    provider, refresh, requirers, tls, Charm, ModelSnafu, Outcome, RelationEventKind, Result,
};
use crate::{
    context::Context,
    domain::{cluster_keys, TLS_ENABLED},
    managers::kyuubi::UpdateOptions,
};

pub async fn on_install(_charm: &Charm<'_>, _context: &Context<'_>) -> Result<Outcome> {
    tracing::info!("installing Kyuubi");
    Ok(Outcome::Done)
}

pub async fn on_pebble_ready(charm: &Charm<'_>, context: &Context<'_>) -> Result<Outcome> {
    if !charm.workload.ready().await {
        return Ok(Outcome::Defer);
    }
    refresh::record_version(charm, context).await?;
    charm.update(context, UpdateOptions::default()).await?;
    Ok(Outcome::Done)
}

pub async fn on_leader_elected(charm: &Charm<'_>, context: &Context<'_>) -> Result<Outcome> {
    charm.refresh_workload(context).await
}

pub async fn on_config_changed(charm: &Charm<'_>, context: &Context<'_>) -> Result<Outcome> {
    if !charm.workload.ready().await {
        tracing::info!("workload container not ready yet, deferring");
        return Ok(Outcome::Defer);
    }

    let leader = charm.is_leader().await?;
    let expose = context.config.expose_external;
    let mut service_pending = false;
    if leader {
        match charm
            .service_manager()
            .reconcile(expose, context.config.loadbalancer_annotations())
            .await
        {
            Ok(changed) => tracing::debug!(changed, %expose, "service reconciled"),
            Err(error) if error.is_retryable() => {
                tracing::info!(%error, "previous service still terminating");
                service_pending = true;
            }
            // without cluster permissions the status tells the operator what to do
            Err(error) => tracing::warn!(%error, "unable to reconcile the service"),
        }
        requirers::request_service_account(charm, context).await?;
    }

    charm.update(context, UpdateOptions::default()).await?;

    if service_pending {
        return Ok(Outcome::Defer);
    }

    if charm
        .service_manager()
        .get_service_endpoint(expose)
        .await
        .is_none()
    {
        tracing::info!(%expose, "service endpoint not available yet, deferring");
        return Ok(Outcome::Defer);
    }

    if tls::renew_if_sans_changed(charm, context).await? {
        return Ok(Outcome::Done);
    }
    if leader {
        provider::update_clients_endpoints(charm, context).await?;
    }
    Ok(Outcome::Done)
}

pub async fn on_update_status(charm: &Charm<'_>, context: &Context<'_>) -> Result<Outcome> {
    if !charm.workload.ready().await {
        return Ok(Outcome::Done);
    }
    tls::renew_if_expiring(charm, context).await?;
    charm.update(context, UpdateOptions::default()).await?;
    Ok(Outcome::Done)
}

pub async fn on_peer_relation(
    charm: &Charm<'_>,
    context: &Context<'_>,
    kind: RelationEventKind,
) -> Result<Outcome> {
    match kind {
        RelationEventKind::Created => {
            if charm.is_leader().await?
                && context.tls_relation_exists().await.context(ModelSnafu)?
            {
                tracing::info!("certificates relation already present, enabling TLS");
                context
                    .update_cluster(&[(cluster_keys::TLS, TLS_ENABLED)])
                    .await
                    .context(ModelSnafu)?;
            }
            Ok(Outcome::Done)
        }
        RelationEventKind::Joined | RelationEventKind::Changed => {
            if !charm.workload.ready().await {
                return Ok(Outcome::Defer);
            }
            let cluster = context.cluster().await.context(ModelSnafu)?;
            let server = context.unit_server().await.context(ModelSnafu)?;
            if cluster.tls
                && server.csr.is_none()
                && context.tls_relation_exists().await.context(ModelSnafu)?
            {
                tls::request_certificate(charm, context, None).await?;
            } else {
                tls::renew_if_sans_changed(charm, context).await?;
            }
            charm.update(context, UpdateOptions::default()).await?;
            Ok(Outcome::Done)
        }
        RelationEventKind::Departed | RelationEventKind::Broken => Ok(Outcome::Done),
    }
}
