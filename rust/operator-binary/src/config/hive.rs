//! `hive-site.xml` pointing Spark at the external metastore.

use std::collections::BTreeMap;

use product_config::writer::to_hadoop_xml;

use crate::domain::DatabaseConnectionInfo;

pub const CONNECTION_URL: &str = "javax.jdo.option.ConnectionURL";
pub const CONNECTION_DRIVER_NAME: &str = "javax.jdo.option.ConnectionDriverName";
pub const CONNECTION_USER_NAME: &str = "javax.jdo.option.ConnectionUserName";
pub const CONNECTION_PASSWORD: &str = "javax.jdo.option.ConnectionPassword";

pub const POSTGRESQL_DRIVER: &str = "org.postgresql.Driver";

pub struct HiveConfig<'a> {
    pub metastore_db: Option<&'a DatabaseConnectionInfo>,
}

impl HiveConfig<'_> {
    /// Without a metastore no property is set and Kyuubi falls back to a local metastore.
    pub fn properties(&self) -> BTreeMap<String, Option<String>> {
        let Some(db) = self.metastore_db else {
            return BTreeMap::new();
        };

        [
            (
                CONNECTION_URL,
                format!(
                    "{url}?createDatabaseIfNotExist=true",
                    url = db.jdbc_url()
                ),
            ),
            (CONNECTION_DRIVER_NAME, POSTGRESQL_DRIVER.to_string()),
            (CONNECTION_USER_NAME, db.username.clone()),
            (CONNECTION_PASSWORD, db.password.clone()),
            ("datanucleus.autoCreateSchema", "true".to_string()),
            ("datanucleus.fixedDatastore", "true".to_string()),
            ("datanucleus.autoCreateTables", "true".to_string()),
            ("hive.metastore.schema.verification", "false".to_string()),
            ("hive.server2.enable.doAs", "false".to_string()),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| (key.to_string(), Some(value)))
        .collect()
    }

    pub fn render(&self) -> String {
        to_hadoop_xml(self.properties().iter())
    }
}
