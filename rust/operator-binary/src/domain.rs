//! Value objects parsed from relation databags and secrets.
//!
//! Every connection info is rebuilt from the current databag on each access. A databag
//! with a required field missing or empty yields `None`, never an error.

use std::collections::{BTreeMap, BTreeSet};

use crate::{charm::KEYSTORE_PATH, juju::Databag};

fn required<'a>(data: &'a Databag, key: &str) -> Option<&'a str> {
    data.get(key).map(String::as_str).filter(|value| !value.is_empty())
}

fn optional(data: &Databag, key: &str) -> Option<String> {
    required(data, key).map(str::to_string)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct S3ConnectionInfo {
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub path: String,
    pub region: Option<String>,
    pub tls_ca_chain: Vec<String>,
}

impl S3ConnectionInfo {
    pub fn from_databag(data: &Databag) -> Option<Self> {
        Some(Self {
            endpoint: optional(data, "endpoint"),
            access_key: required(data, "access-key")?.to_string(),
            secret_key: required(data, "secret-key")?.to_string(),
            bucket: required(data, "bucket")?.to_string(),
            path: data.get("path").cloned().unwrap_or_default(),
            region: optional(data, "region"),
            tls_ca_chain: required(data, "tls-ca-chain")
                .and_then(|chain| serde_json::from_str(chain).ok())
                .unwrap_or_default(),
        })
    }

    pub fn log_dir(&self) -> String {
        format!(
            "s3a://{bucket}/{path}",
            bucket = self.bucket,
            path = self.path.trim_start_matches('/')
        )
    }

    pub fn warehouse_dir(&self) -> String {
        format!("s3a://{bucket}/warehouse", bucket = self.bucket)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatabaseConnectionInfo {
    /// `host:port`, possibly several of them separated by commas.
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub dbname: String,
}

impl DatabaseConnectionInfo {
    /// Parses the provider side of a PostgreSQL relation. Credentials shared through a
    /// Juju secret are passed in as `user_secret`.
    pub fn from_databag(data: &Databag, user_secret: Option<&Databag>) -> Option<Self> {
        let credential = |key: &str| {
            required(data, key)
                .or_else(|| user_secret.and_then(|secret| required(secret, key)))
                .map(str::to_string)
        };
        Some(Self {
            endpoint: required(data, "endpoints")?.to_string(),
            username: credential("username")?,
            password: credential("password")?,
            dbname: required(data, "database")?.to_string(),
        })
    }

    pub fn jdbc_url(&self) -> String {
        format!(
            "jdbc:postgresql://{endpoint}/{dbname}",
            endpoint = self.endpoint,
            dbname = self.dbname
        )
    }

    /// Host and port of the first listed endpoint.
    pub fn primary_host_port(&self) -> (String, u16) {
        let first = self.endpoint.split(',').next().unwrap_or_default().trim();
        match first.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(5432)),
            None => (first.to_string(), 5432),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ZookeeperInfo {
    pub username: String,
    pub password: String,
    /// The chroot znode, e.g. `/kyuubi`.
    pub database: String,
    /// Sorted, de-duplicated `host:port` list without the chroot.
    pub uris: String,
}

impl ZookeeperInfo {
    pub fn from_databag(data: &Databag) -> Option<Self> {
        let database = required(data, "database")?.to_string();
        let raw_uris = required(data, "uris").or_else(|| required(data, "endpoints"))?;
        let uris = raw_uris
            .split(',')
            .map(|uri| uri.replace(database.as_str(), "").trim().to_string())
            .filter(|uri| !uri.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>()
            .join(",");
        if uris.is_empty() {
            return None;
        }

        Some(Self {
            username: required(data, "username")?.to_string(),
            password: required(data, "password")?.to_string(),
            database,
            uris,
        })
    }

    pub fn auth_digest(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceAccountInfo {
    pub namespace: String,
    pub service_account: String,
    pub spark_properties: BTreeMap<String, String>,
}

impl ServiceAccountInfo {
    /// Parses the integration hub side of the service account relation. The account is
    /// published either as `namespace:name` or as a bare name next to a `namespace` key.
    pub fn from_databag(data: &Databag, default_namespace: &str) -> Option<Self> {
        let account = required(data, "service-account")?;
        let (namespace, service_account) = match account.split_once(':') {
            Some((namespace, name)) => (namespace.to_string(), name.to_string()),
            None => (
                optional(data, "namespace").unwrap_or_else(|| default_namespace.to_string()),
                account.to_string(),
            ),
        };
        if namespace.is_empty() || service_account.is_empty() {
            return None;
        }

        let spark_properties = required(data, "spark-properties")
            .and_then(|properties| {
                match serde_json::from_str::<BTreeMap<String, serde_json::Value>>(properties) {
                    Ok(properties) => Some(properties),
                    Err(error) => {
                        tracing::warn!(%error, "ignoring malformed spark-properties");
                        None
                    }
                }
            })
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(value) => (key, value),
                other => (key, other.to_string()),
            })
            .collect();

        Some(Self {
            namespace,
            service_account,
            spark_properties,
        })
    }
}

/// Keys of the unit databag on the peer relation.
pub mod unit_keys {
    pub const HOSTNAME: &str = "hostname";
    pub const IP: &str = "ip";
    pub const PRIVATE_KEY: &str = "private-key";
    pub const CERTIFICATE: &str = "certificate";
    pub const CA_CERT: &str = "ca-cert";
    pub const CSR: &str = "csr";
    pub const KEYSTORE_PASSWORD: &str = "keystore-password";
    pub const TRUSTSTORE_PASSWORD: &str = "truststore-password";
}

/// Keys of the application databag on the peer relation.
pub mod cluster_keys {
    pub const TLS: &str = "tls";
    pub const PRIVATE_KEY: &str = "private-key";
    pub const KYUUBI_VERSION: &str = "kyuubi-version";
    pub const REFRESH_INCOMPATIBLE: &str = "refresh-incompatible";
}

pub const TLS_ENABLED: &str = "enabled";

/// State of one Kyuubi unit, stored in its peer relation databag.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KyuubiServer {
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub private_key: Option<String>,
    pub certificate: Option<String>,
    pub ca_cert: Option<String>,
    pub csr: Option<String>,
    pub keystore_password: Option<String>,
    pub truststore_password: Option<String>,
}

impl KyuubiServer {
    pub fn from_databag(data: &Databag) -> Self {
        Self {
            hostname: optional(data, unit_keys::HOSTNAME),
            ip: optional(data, unit_keys::IP),
            private_key: optional(data, unit_keys::PRIVATE_KEY),
            certificate: optional(data, unit_keys::CERTIFICATE),
            ca_cert: optional(data, unit_keys::CA_CERT),
            csr: optional(data, unit_keys::CSR),
            keystore_password: optional(data, unit_keys::KEYSTORE_PASSWORD),
            truststore_password: optional(data, unit_keys::TRUSTSTORE_PASSWORD),
        }
    }
}

/// Application wide state, written by the leader only.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KyuubiCluster {
    pub tls: bool,
    pub private_key: Option<String>,
    pub kyuubi_version: Option<String>,
    pub refresh_incompatible: Option<String>,
}

impl KyuubiCluster {
    pub fn from_databag(data: &Databag) -> Self {
        Self {
            tls: required(data, cluster_keys::TLS) == Some(TLS_ENABLED),
            private_key: optional(data, cluster_keys::PRIVATE_KEY),
            kyuubi_version: optional(data, cluster_keys::KYUUBI_VERSION),
            refresh_incompatible: optional(data, cluster_keys::REFRESH_INCOMPATIBLE),
        }
    }
}

/// TLS material Kyuubi's frontend is configured with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TlsInfo {
    pub keystore_password: String,
    pub keystore_path: String,
}

impl TlsInfo {
    pub fn new(keystore_password: impl Into<String>) -> Self {
        Self {
            keystore_password: keystore_password.into(),
            keystore_path: KEYSTORE_PATH.to_string(),
        }
    }
}

/// TLS as seen by the reconciliation: off, requested but not yet usable, or ready.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum TlsState {
    #[default]
    Disabled,
    Pending,
    Ready(TlsInfo),
}

impl TlsState {
    pub fn resolve(cluster: &KyuubiCluster, server: &KyuubiServer) -> Self {
        if !cluster.tls {
            return Self::Disabled;
        }
        match (&server.certificate, &server.keystore_password) {
            (Some(_), Some(password)) => Self::Ready(TlsInfo::new(password)),
            _ => Self::Pending,
        }
    }

    pub fn info(&self) -> Option<&TlsInfo> {
        match self {
            Self::Ready(info) => Some(info),
            _ => None,
        }
    }
}
