//! Access to the Juju model: relation databags, secrets, config, status and actions.
//!
//! Relation data is handled as plain string maps ([`Databag`]) at this boundary and
//! parsed into typed value objects by [`crate::domain`].

pub mod deferred;
pub mod hook_tools;

use std::{collections::BTreeMap, fmt, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{Display, EnumString};

use crate::status::CharmStatus;

pub type Databag = BTreeMap<String, String>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to run hook tool {tool}"))]
    SpawnHookTool {
        source: std::io::Error,
        tool: String,
    },

    #[snafu(display("hook tool {tool} failed: {stderr}"))]
    HookToolFailed { tool: String, stderr: String },

    #[snafu(display("failed to parse output of hook tool {tool}"))]
    ParseHookToolOutput {
        source: serde_json::Error,
        tool: String,
    },

    #[snafu(display("failed to serialize input for hook tool {tool}"))]
    SerializeHookToolInput {
        source: serde_json::Error,
        tool: String,
    },

    #[snafu(display("invalid relation id {input:?}, expected <endpoint>:<id>"))]
    InvalidRelationId { input: String },

    #[snafu(display("failed to access deferral queue at {path}"))]
    DeferralQueueIo {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("failed to (de)serialize deferral queue"))]
    DeferralQueueFormat { source: serde_json::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A single relation instance, e.g. `certificates:12`.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Relation {
    pub endpoint: String,
    pub id: u32,
    pub remote_app: Option<String>,
}

impl Relation {
    pub fn new(endpoint: impl Into<String>, id: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            id,
            remote_app: None,
        }
    }

    pub fn with_remote_app(mut self, remote_app: impl Into<String>) -> Self {
        self.remote_app = Some(remote_app.into());
        self
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.id)
    }
}

impl FromStr for Relation {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let (endpoint, id) = input
            .rsplit_once(':')
            .context(InvalidRelationIdSnafu { input })?;
        let id = id
            .parse()
            .ok()
            .context(InvalidRelationIdSnafu { input })?;
        Ok(Self::new(endpoint, id))
    }
}

/// Which side of a relation a databag belongs to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Bag {
    LocalApp,
    LocalUnit,
    RemoteApp,
    RemoteUnit(String),
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum StatusTarget {
    Unit,
    Application,
}

/// Outcome of looking up a secret that the operator referenced by URI.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SecretLookup {
    NotFound,
    Forbidden,
    Content(Databag),
}

/// Everything the charm reads from or writes to the Juju model.
#[async_trait]
pub trait Model: Send + Sync {
    fn unit_name(&self) -> &str;

    fn model_name(&self) -> &str;

    fn app_name(&self) -> &str {
        let unit = self.unit_name();
        unit.split_once('/').map_or(unit, |(app, _)| app)
    }

    /// The pod name backing this unit, e.g. `kyuubi-k8s-0`.
    fn pod_name(&self) -> String {
        self.unit_name().replace('/', "-")
    }

    async fn is_leader(&self) -> Result<bool>;

    async fn config(&self) -> Result<serde_json::Value>;

    async fn relations(&self, endpoint: &str) -> Result<Vec<Relation>>;

    /// Remote units currently joined to the relation.
    async fn relation_units(&self, relation: &Relation) -> Result<Vec<String>>;

    async fn read(&self, relation: &Relation, bag: &Bag) -> Result<Databag>;

    /// Writes `changes` into a local databag. Empty values remove the key.
    async fn write(&self, relation: &Relation, bag: &Bag, changes: &Databag) -> Result<()>;

    /// Content of a secret owned by this application, looked up by label.
    async fn secret_by_label(&self, label: &str) -> Result<Option<Databag>>;

    /// Creates or replaces the content of an application owned secret.
    async fn set_secret(&self, label: &str, content: &Databag) -> Result<()>;

    async fn secret_by_id(&self, id: &str) -> Result<SecretLookup>;

    async fn planned_units(&self) -> Result<u32>;

    async fn set_status(&self, target: StatusTarget, status: &CharmStatus) -> Result<()>;

    async fn set_workload_version(&self, version: &str) -> Result<()>;

    async fn bind_address(&self, endpoint: &str) -> Result<Option<String>>;

    async fn action_params(&self) -> Result<serde_json::Value>;

    async fn action_set(&self, results: &Databag) -> Result<()>;

    async fn action_fail(&self, message: &str) -> Result<()>;

    async fn action_log(&self, message: &str) -> Result<()>;
}
