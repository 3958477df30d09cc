//! `kyuubi-defaults.conf`: JDBC authentication, Zookeeper HA and frontend TLS.

use std::collections::BTreeMap;

use crate::{
    charm::{AUTHENTICATION_TABLE_NAME, KYUUBI_DEFAULTS_CONF},
    config::{hive::POSTGRESQL_DRIVER, to_properties, Result},
    domain::{DatabaseConnectionInfo, TlsInfo, ZookeeperInfo},
};

pub const KYUUBI_AUTHENTICATION: &str = "kyuubi.authentication";
pub const KYUUBI_HA_ADDRESSES: &str = "kyuubi.ha.addresses";
pub const KYUUBI_HA_NAMESPACE: &str = "kyuubi.ha.namespace";
pub const KYUUBI_SSL_KEYSTORE_PATH: &str = "kyuubi.frontend.ssl.keystore.path";

pub struct KyuubiConfig<'a> {
    pub auth_db: Option<&'a DatabaseConnectionInfo>,
    pub zookeeper: Option<&'a ZookeeperInfo>,
    pub tls: Option<&'a TlsInfo>,
}

impl KyuubiConfig<'_> {
    /// Users are checked against the salted hashes stored by the authentication manager.
    fn authentication_query() -> String {
        format!(
            "SELECT 1 FROM {AUTHENTICATION_TABLE_NAME} WHERE username=${{user}} AND passwd=crypt(${{password}}, passwd)"
        )
    }

    fn auth_conf(&self) -> BTreeMap<String, Option<String>> {
        let Some(db) = self.auth_db else {
            return BTreeMap::new();
        };
        BTreeMap::from([
            (KYUUBI_AUTHENTICATION.to_string(), Some("JDBC".to_string())),
            (
                "kyuubi.authentication.jdbc.driver.class".to_string(),
                Some(POSTGRESQL_DRIVER.to_string()),
            ),
            (
                "kyuubi.authentication.jdbc.url".to_string(),
                Some(db.jdbc_url()),
            ),
            (
                "kyuubi.authentication.jdbc.user".to_string(),
                Some(db.username.clone()),
            ),
            (
                "kyuubi.authentication.jdbc.password".to_string(),
                Some(db.password.clone()),
            ),
            (
                "kyuubi.authentication.jdbc.query".to_string(),
                Some(Self::authentication_query()),
            ),
        ])
    }

    fn ha_conf(&self) -> BTreeMap<String, Option<String>> {
        let Some(zookeeper) = self.zookeeper else {
            return BTreeMap::new();
        };
        BTreeMap::from([
            (
                KYUUBI_HA_ADDRESSES.to_string(),
                Some(zookeeper.uris.clone()),
            ),
            (
                KYUUBI_HA_NAMESPACE.to_string(),
                Some(zookeeper.database.clone()),
            ),
            (
                "kyuubi.ha.zookeeper.auth.type".to_string(),
                Some("DIGEST".to_string()),
            ),
            (
                "kyuubi.ha.zookeeper.auth.digest".to_string(),
                Some(zookeeper.auth_digest()),
            ),
        ])
    }

    fn tls_conf(&self) -> BTreeMap<String, Option<String>> {
        let Some(tls) = self.tls else {
            return BTreeMap::new();
        };
        BTreeMap::from([
            (
                "kyuubi.frontend.ssl.keystore.password".to_string(),
                Some(tls.keystore_password.clone()),
            ),
            (
                KYUUBI_SSL_KEYSTORE_PATH.to_string(),
                Some(tls.keystore_path.clone()),
            ),
            (
                "kyuubi.frontend.ssl.keystore.type".to_string(),
                Some("PKCS12".to_string()),
            ),
            (
                "kyuubi.frontend.thrift.binary.ssl.enabled".to_string(),
                Some("true".to_string()),
            ),
            // the thrift http frontend serves the same certificate
            (
                "kyuubi.frontend.thrift.http.ssl.keystore.password".to_string(),
                Some(tls.keystore_password.clone()),
            ),
            (
                "kyuubi.frontend.thrift.http.ssl.keystore.path".to_string(),
                Some(tls.keystore_path.clone()),
            ),
            (
                "kyuubi.frontend.thrift.http.use.SSL".to_string(),
                Some("true".to_string()),
            ),
        ])
    }

    pub fn properties(&self) -> BTreeMap<String, Option<String>> {
        let mut conf = self.auth_conf();
        conf.extend(self.ha_conf());
        conf.extend(self.tls_conf());
        conf
    }

    pub fn render(&self) -> Result<String> {
        to_properties(KYUUBI_DEFAULTS_CONF, self.properties())
    }
}
