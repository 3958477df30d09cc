//! In-place refreshes of the workload.
//!
//! The leader records the Kyuubi version the application runs in the peer databag. When
//! a refresh brings a version Kyuubi cannot be upgraded to in place, the leader blocks
//! the workload until an operator runs `force-refresh`.

use snafu::ResultExt;

use super::{Charm, ModelSnafu, Outcome, Result};
use crate::{
    context::Context, domain::cluster_keys, kyuubi_version::is_workload_compatible,
    managers::kyuubi::UpdateOptions,
};

/// Stores the running Kyuubi version unless one is recorded already.
pub async fn record_version(charm: &Charm<'_>, context: &Context<'_>) -> Result<()> {
    if !charm.is_leader().await? {
        return Ok(());
    }
    if context
        .cluster()
        .await
        .context(ModelSnafu)?
        .kyuubi_version
        .is_some()
    {
        return Ok(());
    }
    let Some(version) = charm.workload.kyuubi_version().await else {
        return Ok(());
    };
    tracing::info!(%version, "recording Kyuubi version");
    context
        .update_cluster(&[(cluster_keys::KYUUBI_VERSION, &version)])
        .await
        .context(ModelSnafu)
}

pub async fn on_upgrade_charm(charm: &Charm<'_>, context: &Context<'_>) -> Result<Outcome> {
    if !charm.workload.ready().await {
        return Ok(Outcome::Defer);
    }

    match (
        context.cluster().await.context(ModelSnafu)?.kyuubi_version,
        charm.workload.kyuubi_version().await,
    ) {
        (_, None) => tracing::warn!("unable to read the Kyuubi version of the new workload"),
        (None, Some(_)) => record_version(charm, context).await?,
        (Some(old), Some(new)) if old == new => {
            tracing::info!(version = %new, "Kyuubi version unchanged")
        }
        (Some(old), Some(new)) if charm.is_leader().await? => {
            if is_workload_compatible(&old, &new) {
                tracing::info!(%old, %new, "refreshing Kyuubi");
                context
                    .update_cluster(&[(cluster_keys::KYUUBI_VERSION, &new)])
                    .await
                    .context(ModelSnafu)?;
            } else {
                tracing::warn!(%old, %new, "refresh is incompatible, keeping Kyuubi down");
                context
                    .update_cluster(&[(
                        cluster_keys::REFRESH_INCOMPATIBLE,
                        &format!("{old} to {new}"),
                    )])
                    .await
                    .context(ModelSnafu)?;
            }
        }
        (Some(_), Some(_)) => {}
    }

    charm.update(context, UpdateOptions::default()).await?;
    Ok(Outcome::Done)
}

/// Lifts the refresh block and accepts the running version as the recorded one.
pub async fn force_refresh(charm: &Charm<'_>, context: &Context<'_>) -> Result<()> {
    let version = charm.workload.kyuubi_version().await.unwrap_or_default();
    tracing::warn!(%version, "forcing the refresh");
    context
        .update_cluster(&[
            (cluster_keys::REFRESH_INCOMPATIBLE, ""),
            (cluster_keys::KYUUBI_VERSION, &version),
        ])
        .await
        .context(ModelSnafu)?;
    charm.update(context, UpdateOptions::default()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::Event,
        juju::deferred::DeferredQueue,
        status::CharmStatus,
        testing::Harness,
    };

    async fn upgrade_to(harness: &Harness, version: &str) -> CharmStatus {
        harness.workload.set_release(version);
        harness
            .charm()
            .dispatch(Event::UpgradeCharm, &mut DeferredQueue::default())
            .await
            .unwrap()
    }

    async fn running(harness: &Harness) {
        harness.relate_s3();
        harness.relate_integration_hub();
        let mut queue = DeferredQueue::default();
        for event in [Event::PebbleReady, Event::ConfigChanged] {
            harness.charm().dispatch(event, &mut queue).await.unwrap();
        }
        assert_eq!(harness.cluster_state().kyuubi_version.as_deref(), Some("1.10.2"));
    }

    #[tokio::test]
    async fn test_compatible_refresh_updates_the_version() {
        let harness = Harness::new();
        running(&harness).await;

        assert_eq!(upgrade_to(&harness, "1.11.0").await, CharmStatus::Active);
        let cluster = harness.cluster_state();
        assert_eq!(cluster.kyuubi_version.as_deref(), Some("1.11.0"));
        assert_eq!(cluster.refresh_incompatible, None);
    }

    #[tokio::test]
    async fn test_downgrade_blocks_until_forced() {
        let harness = Harness::new();
        running(&harness).await;
        let restarts = harness.workload.restarts();

        let status = upgrade_to(&harness, "1.9.0").await;
        assert_eq!(
            status,
            CharmStatus::UpgradeIncompatible("1.10.2 to 1.9.0".to_string())
        );
        assert_eq!(harness.workload.restarts(), restarts);

        let context = harness.charm().context().await.unwrap();
        force_refresh(&harness.charm(), &context).await.unwrap();
        let cluster = harness.cluster_state();
        assert_eq!(cluster.refresh_incompatible, None);
        assert_eq!(cluster.kyuubi_version.as_deref(), Some("1.9.0"));
    }

    #[tokio::test]
    async fn test_upgrade_is_deferred_without_workload() {
        let harness = Harness::new();
        harness.workload.set_ready(false);
        let context = harness.charm().context().await.unwrap();
        assert_eq!(
            on_upgrade_charm(&harness.charm(), &context).await.unwrap(),
            Outcome::Defer
        );
    }
}
