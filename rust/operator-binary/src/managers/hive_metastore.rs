//! Schema of the external Hive metastore.

use snafu::{ResultExt, Snafu};

use crate::{command, managers::database::SqlExecutor, workload::Workload};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to initialize the metastore schema to {version}"))]
    InitializeSchema {
        source: crate::workload::Error,
        version: String,
    },

    #[snafu(display("failed to restart Kyuubi after the schema initialization"))]
    Restart { source: crate::workload::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// `major.minor` of a schema version such as `2.3.0`. Schema tables written by some
/// distributions carry only `major.minor` or a pre-release suffix.
fn major_minor(version: &str) -> Option<(u64, u64)> {
    let trimmed = version.trim();
    let padded = match trimmed.split('.').count() {
        2 => format!("{trimmed}.0"),
        _ => trimmed.to_string(),
    };
    semver::Version::parse(&padded)
        .map(|version| (version.major, version.minor))
        .map_err(|error| tracing::debug!(%error, version, "unparsable schema version"))
        .ok()
}

pub struct HiveMetastoreManager<'a> {
    workload: &'a dyn Workload,
}

impl<'a> HiveMetastoreManager<'a> {
    pub fn new(workload: &'a dyn Workload) -> Self {
        Self { workload }
    }

    pub async fn initialize_schema(&self, version: &str) -> Result<()> {
        tracing::info!(version, "initializing the metastore schema");
        self.workload
            .exec(&command::init_hive_schema(version))
            .await
            .context(InitializeSchemaSnafu { version })?;
        self.workload.restart().await.context(RestartSnafu)
    }
}

/// A metastore without any table in `public` has never been initialized.
pub async fn is_safe_to_initialize(database: &dyn SqlExecutor) -> bool {
    let (ok, rows) = database
        .execute(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public'",
            &[],
            None,
        )
        .await;
    ok && rows.is_empty()
}

/// Whether Kyuubi can work with the metastore: either it can still be initialized, or
/// its schema shares `major.minor` with `expected_version`.
pub async fn is_metastore_valid(database: &dyn SqlExecutor, expected_version: &str) -> bool {
    if is_safe_to_initialize(database).await {
        return true;
    }

    let (ok, rows) = database
        .execute(r#"SELECT "SCHEMA_VERSION" FROM "VERSION""#, &[], None)
        .await;
    if !ok {
        tracing::warn!("unable to read the metastore schema version");
        return false;
    }
    let found = rows
        .first()
        .and_then(|row| row.first().cloned().flatten())
        .unwrap_or_default();
    let found_version = major_minor(&found);
    let valid = found_version.is_some() && found_version == major_minor(expected_version);
    if !valid {
        tracing::warn!(found, expected = expected_version, "incompatible metastore schema");
    }
    valid
}
