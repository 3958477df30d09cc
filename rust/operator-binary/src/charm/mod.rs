use std::collections::BTreeMap;

use const_format::concatcp;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use strum::{Display, EnumString};

pub const CONTAINER_NAME: &str = "kyuubi";
pub const SERVICE_NAME: &str = "kyuubi";

// ports
pub const JDBC_PORT: u16 = 10009;
pub const JDBC_PORT_NAME: &str = "kyuubi-jdbc";

// relation endpoints
pub const PEER_REL: &str = "kyuubi-peers";
pub const S3_REL: &str = "s3-credentials";
pub const METASTORE_DB_REL: &str = "metastore-db";
pub const AUTH_DB_REL: &str = "auth-db";
pub const SERVICE_ACCOUNT_REL: &str = "spark-service-account";
pub const ZOOKEEPER_REL: &str = "zookeeper";
pub const TLS_REL: &str = "certificates";
pub const CLIENT_REL: &str = "jdbc";

// databases
pub const METASTORE_DATABASE_NAME: &str = "hivemetastore";
pub const AUTHENTICATION_DATABASE_NAME: &str = "auth_db";
pub const AUTHENTICATION_TABLE_NAME: &str = "kyuubi_users";
pub const POSTGRESQL_DEFAULT_DATABASE: &str = "postgres";
pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
pub const HIVE_SCHEMA_VERSION: &str = "2.3.0";

// zookeeper
pub const HA_ZNODE_NAME: &str = "/kyuubi";

// images
pub const SPARK_JOB_IMAGE: &str = "ghcr.io/canonical/charmed-spark:3.4-22.04_edge";
pub const SPARK_DEFAULT_CATALOG_NAME: &str = "spark_catalog";

// directories
pub const KYUUBI_ROOT: &str = "/opt/kyuubi";
pub const KYUUBI_CONF_DIR: &str = concatcp!(KYUUBI_ROOT, "/conf");
pub const SPARK_CONF_DIR: &str = "/etc/spark8t/conf";
pub const HIVE_ROOT: &str = "/opt/hive";

// file names
pub const KYUUBI_DEFAULTS_CONF: &str = "kyuubi-defaults.conf";
pub const SPARK_DEFAULTS_CONF: &str = "spark-defaults.conf";
pub const HIVE_SITE_XML: &str = "hive-site.xml";

// file paths
pub const SERVER_KEY_PATH: &str = concatcp!(KYUUBI_CONF_DIR, "/server.key");
pub const CA_PATH: &str = concatcp!(KYUUBI_CONF_DIR, "/ca.pem");
pub const CERTIFICATE_PATH: &str = concatcp!(KYUUBI_CONF_DIR, "/server.pem");
pub const TRUSTSTORE_PATH: &str = concatcp!(KYUUBI_CONF_DIR, "/truststore.jks");
pub const KEYSTORE_PATH: &str = concatcp!(KYUUBI_CONF_DIR, "/keystore.p12");
pub const KYUUBI_DEFAULTS_PATH: &str = concatcp!(KYUUBI_CONF_DIR, "/", KYUUBI_DEFAULTS_CONF);
pub const SPARK_DEFAULTS_PATH: &str = concatcp!(SPARK_CONF_DIR, "/", SPARK_DEFAULTS_CONF);
pub const HIVE_SITE_PATH: &str = concatcp!(SPARK_CONF_DIR, "/", HIVE_SITE_XML);
pub const KYUUBI_RELEASE_PATH: &str = concatcp!(KYUUBI_ROOT, "/RELEASE");
pub const SCHEMATOOL_PATH: &str = concatcp!(HIVE_ROOT, "/bin/schematool.sh");

// truststore aliases
pub const TRUSTSTORE_CA_ALIAS: &str = "ca";
pub const TRUSTSTORE_OLD_CA_ALIAS: &str = "old-ca";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to parse charm configuration"))]
    ParseConfig { source: serde_json::Error },
}

/// How the JDBC endpoint is exposed outside of the Kubernetes cluster.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
)]
pub enum ExposeExternal {
    #[default]
    #[serde(rename = "false")]
    #[strum(serialize = "false")]
    False,

    #[serde(rename = "nodeport")]
    #[strum(serialize = "nodeport")]
    NodePort,

    #[serde(rename = "loadbalancer")]
    #[strum(serialize = "loadbalancer")]
    LoadBalancer,
}

impl ExposeExternal {
    /// The Kubernetes Service type backing this exposure mode.
    pub fn service_type(&self) -> &'static str {
        match self {
            ExposeExternal::False => "ClusterIP",
            ExposeExternal::NodePort => "NodePort",
            ExposeExternal::LoadBalancer => "LoadBalancer",
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Profile {
    #[default]
    Production,
    Staging,
    Testing,
}

/// Operator supplied configuration, as returned by `config-get`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct CharmConfig {
    #[serde(default)]
    pub namespace: String,

    #[serde(default = "CharmConfig::default_service_account")]
    pub service_account: String,

    #[serde(default)]
    pub expose_external: ExposeExternal,

    #[serde(default = "CharmConfig::default_annotations")]
    pub loadbalancer_extra_annotations: String,

    #[serde(default)]
    pub enable_dynamic_allocation: bool,

    #[serde(default = "CharmConfig::default_iceberg_catalog_name")]
    pub iceberg_catalog_name: String,

    #[serde(default)]
    pub profile: Profile,

    /// Juju secret URI holding the `admin` password.
    #[serde(default)]
    pub system_users: Option<String>,

    /// Juju secret URI holding the TLS private key.
    #[serde(default)]
    pub tls_client_private_key: Option<String>,
}

impl Default for CharmConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            service_account: Self::default_service_account(),
            expose_external: ExposeExternal::default(),
            loadbalancer_extra_annotations: Self::default_annotations(),
            enable_dynamic_allocation: false,
            iceberg_catalog_name: Self::default_iceberg_catalog_name(),
            profile: Profile::default(),
            system_users: None,
            tls_client_private_key: None,
        }
    }
}

impl CharmConfig {
    fn default_service_account() -> String {
        "kyuubi-spark-engine".to_string()
    }

    fn default_annotations() -> String {
        "{}".to_string()
    }

    fn default_iceberg_catalog_name() -> String {
        "iceberg".to_string()
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, Error> {
        serde_json::from_value(value).context(ParseConfigSnafu)
    }

    /// The namespace Spark jobs run in, falling back to the model name.
    pub fn effective_namespace<'a>(&'a self, model_name: &'a str) -> &'a str {
        if self.namespace.is_empty() {
            model_name
        } else {
            &self.namespace
        }
    }

    /// Annotations to put on the exposing Service. Invalid JSON yields no annotations.
    pub fn loadbalancer_annotations(&self) -> BTreeMap<String, String> {
        match serde_json::from_str::<BTreeMap<String, serde_json::Value>>(
            &self.loadbalancer_extra_annotations,
        ) {
            Ok(annotations) => annotations
                .into_iter()
                .map(|(key, value)| match value {
                    serde_json::Value::String(value) => (key, value),
                    other => (key, other.to_string()),
                })
                .collect(),
            Err(error) => {
                tracing::warn!(
                    %error,
                    "loadbalancer-extra-annotations is not a valid JSON object, ignoring it"
                );
                BTreeMap::new()
            }
        }
    }
}
