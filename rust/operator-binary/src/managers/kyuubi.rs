//! The single path that writes Kyuubi's configuration files and restarts the service.

use snafu::{ResultExt, Snafu};

use crate::{
    charm::{CharmConfig, HIVE_SITE_PATH, KYUUBI_DEFAULTS_PATH, SPARK_DEFAULTS_PATH},
    config::{self, hive::HiveConfig, kyuubi::KyuubiConfig, spark::SparkConfig},
    domain::{
        DatabaseConnectionInfo, S3ConnectionInfo, ServiceAccountInfo, TlsState, ZookeeperInfo,
    },
    workload::{self, Workload},
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to render configuration"))]
    Render { source: config::Error },

    #[snafu(display("failed to read {path}"))]
    ReadFile {
        source: workload::Error,
        path: &'static str,
    },

    #[snafu(display("failed to write {path}"))]
    WriteFile {
        source: workload::Error,
        path: &'static str,
    },

    #[snafu(display("failed to stop Kyuubi"))]
    Stop { source: workload::Error },

    #[snafu(display("failed to restart Kyuubi"))]
    Restart { source: workload::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Snapshot of everything the configuration files are rendered from.
#[derive(Clone, Debug, Default)]
pub struct KyuubiInputs {
    pub charm_config: CharmConfig,
    pub api_server: String,
    pub s3: Option<S3ConnectionInfo>,
    pub metastore_db: Option<DatabaseConnectionInfo>,
    pub auth_db: Option<DatabaseConnectionInfo>,
    pub service_account: Option<ServiceAccountInfo>,
    pub zookeeper: Option<ZookeeperInfo>,
    pub tls: TlsState,
    /// Cleared while a refresh keeps the workload from starting.
    pub allowed_to_start: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UpdateOptions {
    /// Rewrite every file and restart even when nothing changed, e.g. after the
    /// keystore was replaced.
    pub force_restart: bool,
    /// Render without the TLS block, used while TLS is being torn down.
    pub set_tls_none: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UpdateOutcome {
    pub written: Vec<&'static str>,
    pub restarted: bool,
    pub stopped: bool,
}

pub struct KyuubiManager<'a> {
    workload: &'a dyn Workload,
}

impl<'a> KyuubiManager<'a> {
    pub fn new(workload: &'a dyn Workload) -> Self {
        Self { workload }
    }

    fn render(inputs: &KyuubiInputs, tls: &TlsState) -> Result<[(&'static str, String); 3]> {
        let spark = SparkConfig {
            charm_config: &inputs.charm_config,
            api_server: &inputs.api_server,
            service_account: inputs.service_account.as_ref(),
            s3: inputs.s3.as_ref(),
            metastore_db: inputs.metastore_db.as_ref(),
        }
        .render()
        .context(RenderSnafu)?;
        let hive = HiveConfig {
            metastore_db: inputs.metastore_db.as_ref(),
        }
        .render();
        let kyuubi = KyuubiConfig {
            auth_db: inputs.auth_db.as_ref(),
            zookeeper: inputs.zookeeper.as_ref(),
            tls: tls.info(),
        }
        .render()
        .context(RenderSnafu)?;

        Ok([
            (SPARK_DEFAULTS_PATH, spark),
            (HIVE_SITE_PATH, hive),
            (KYUUBI_DEFAULTS_PATH, kyuubi),
        ])
    }

    /// Writes `content` unless the file already holds it. A missing file counts as empty.
    async fn compare_and_write(
        &self,
        path: &'static str,
        content: &str,
        force: bool,
    ) -> Result<bool> {
        let existing = self
            .workload
            .read(path)
            .await
            .context(ReadFileSnafu { path })?
            .unwrap_or_default();
        if existing == content && !force {
            return Ok(false);
        }
        tracing::debug!(path, "writing configuration file");
        self.workload
            .write(path, content)
            .await
            .context(WriteFileSnafu { path })?;
        Ok(true)
    }

    pub async fn update(
        &self,
        inputs: &KyuubiInputs,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome> {
        let tls = if options.set_tls_none {
            TlsState::Disabled
        } else {
            inputs.tls.clone()
        };

        let mut outcome = UpdateOutcome::default();
        for (path, content) in Self::render(inputs, &tls)? {
            if self
                .compare_and_write(path, &content, options.force_restart)
                .await?
            {
                outcome.written.push(path);
            }
        }

        if tls == TlsState::Pending {
            tracing::info!("stopping Kyuubi until the TLS keystore is in place");
            self.workload.stop().await.context(StopSnafu)?;
            outcome.stopped = true;
            return Ok(outcome);
        }

        let inactive = !self.workload.active().await;
        if outcome.written.is_empty() && !inactive && !options.force_restart {
            tracing::info!("configuration unchanged, skipping restart");
            return Ok(outcome);
        }

        if !inputs.allowed_to_start {
            tracing::info!("Kyuubi is not allowed to start during the refresh, skipping restart");
            return Ok(outcome);
        }

        tracing::info!(
            changed = ?outcome.written,
            inactive,
            force = options.force_restart,
            "restarting Kyuubi"
        );
        self.workload.restart().await.context(RestartSnafu)?;
        outcome.restarted = true;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{domain::TlsInfo, testing::FakeWorkload};

    fn inputs() -> KyuubiInputs {
        KyuubiInputs {
            api_server: "https://10.152.183.1:443".to_string(),
            zookeeper: Some(ZookeeperInfo {
                username: "kyuubi".to_string(),
                password: "pw".to_string(),
                database: "/kyuubi".to_string(),
                uris: "zk-0:2181".to_string(),
            }),
            allowed_to_start: true,
            ..KyuubiInputs::default()
        }
    }

    #[tokio::test]
    async fn test_second_update_is_a_noop() {
        let workload = FakeWorkload::default();
        let manager = KyuubiManager::new(&workload);

        let first = manager.update(&inputs(), UpdateOptions::default()).await.unwrap();
        assert_eq!(first.written.len(), 3);
        assert!(first.restarted);

        let second = manager.update(&inputs(), UpdateOptions::default()).await.unwrap();
        assert_eq!(second, UpdateOutcome::default());
        assert_eq!(workload.restarts(), 1);
    }

    #[tokio::test]
    async fn test_only_changed_file_is_written() {
        let workload = FakeWorkload::default();
        let manager = KyuubiManager::new(&workload);
        manager.update(&inputs(), UpdateOptions::default()).await.unwrap();

        let mut changed = inputs();
        changed.zookeeper = None;
        let outcome = manager.update(&changed, UpdateOptions::default()).await.unwrap();
        assert_eq!(outcome.written, vec![KYUUBI_DEFAULTS_PATH]);
        assert!(outcome.restarted);
        assert_eq!(workload.restarts(), 2);
    }

    #[tokio::test]
    async fn test_inactive_service_is_restarted() {
        let workload = FakeWorkload::default();
        let manager = KyuubiManager::new(&workload);
        manager.update(&inputs(), UpdateOptions::default()).await.unwrap();

        workload.stop().await.unwrap();
        let outcome = manager.update(&inputs(), UpdateOptions::default()).await.unwrap();
        assert!(outcome.written.is_empty());
        assert!(outcome.restarted);
    }

    #[tokio::test]
    async fn test_force_restart_rewrites_everything() {
        let workload = FakeWorkload::default();
        let manager = KyuubiManager::new(&workload);
        manager.update(&inputs(), UpdateOptions::default()).await.unwrap();

        let outcome = manager
            .update(
                &inputs(),
                UpdateOptions {
                    force_restart: true,
                    ..UpdateOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.written.len(), 3);
        assert!(outcome.restarted);
    }

    #[tokio::test]
    async fn test_pending_tls_stops_the_service() {
        let workload = FakeWorkload::default();
        let manager = KyuubiManager::new(&workload);
        manager.update(&inputs(), UpdateOptions::default()).await.unwrap();

        let mut pending = inputs();
        pending.tls = TlsState::Pending;
        let outcome = manager.update(&pending, UpdateOptions::default()).await.unwrap();
        assert!(outcome.stopped);
        assert!(!outcome.restarted);
        assert!(!workload.active().await);

        // tearing TLS down renders without it regardless of the unit state
        let mut ready = inputs();
        ready.tls = TlsState::Ready(TlsInfo::new("ks"));
        let outcome = manager
            .update(
                &ready,
                UpdateOptions {
                    set_tls_none: true,
                    ..UpdateOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(outcome.restarted);
        let rendered = workload.file(KYUUBI_DEFAULTS_PATH).unwrap();
        assert!(!rendered.contains("keystore"));
    }

    #[tokio::test]
    async fn test_refresh_keeps_workload_down() {
        let workload = FakeWorkload::default();
        let manager = KyuubiManager::new(&workload);

        let mut blocked = inputs();
        blocked.allowed_to_start = false;
        let outcome = manager.update(&blocked, UpdateOptions::default()).await.unwrap();
        assert_eq!(outcome.written.len(), 3);
        assert!(!outcome.restarted);
        assert_eq!(workload.restarts(), 0);
    }
}
