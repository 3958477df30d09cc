//! `spark-defaults.conf` used by the Spark engines Kyuubi launches.

use std::collections::BTreeMap;

use crate::{
    charm::{CharmConfig, Profile, SPARK_DEFAULTS_CONF, SPARK_DEFAULT_CATALOG_NAME, SPARK_JOB_IMAGE},
    config::{to_properties, Result},
    domain::{DatabaseConnectionInfo, S3ConnectionInfo, ServiceAccountInfo},
};

pub const SPARK_MASTER: &str = "spark.master";
pub const SPARK_CONTAINER_IMAGE: &str = "spark.kubernetes.container.image";
pub const SPARK_DEPLOY_MODE: &str = "spark.submit.deployMode";
pub const SPARK_NAMESPACE: &str = "spark.kubernetes.namespace";
pub const SPARK_DRIVER_SERVICE_ACCOUNT: &str =
    "spark.kubernetes.authenticate.driver.serviceAccountName";
pub const SPARK_WAREHOUSE_DIR: &str = "spark.sql.warehouse.dir";
pub const SPARK_FILE_UPLOAD_PATH: &str = "spark.kubernetes.file.upload.path";
pub const SPARK_SQL_EXTENSIONS: &str = "spark.sql.extensions";

const ICEBERG_EXTENSIONS: &str =
    "org.apache.iceberg.spark.extensions.IcebergSparkSessionExtensions";

pub struct SparkConfig<'a> {
    pub charm_config: &'a CharmConfig,
    /// Address of the Kubernetes API server the engines are submitted to.
    pub api_server: &'a str,
    pub service_account: Option<&'a ServiceAccountInfo>,
    pub s3: Option<&'a S3ConnectionInfo>,
    pub metastore_db: Option<&'a DatabaseConnectionInfo>,
}

impl SparkConfig<'_> {
    fn base_conf(&self) -> BTreeMap<String, Option<String>> {
        let mut conf = BTreeMap::from([
            (
                SPARK_MASTER.to_string(),
                (!self.api_server.is_empty()).then(|| format!("k8s://{}", self.api_server)),
            ),
            (
                SPARK_CONTAINER_IMAGE.to_string(),
                Some(SPARK_JOB_IMAGE.to_string()),
            ),
            (SPARK_DEPLOY_MODE.to_string(), Some("cluster".to_string())),
        ]);

        if self.charm_config.enable_dynamic_allocation {
            conf.insert(
                "spark.dynamicAllocation.enabled".to_string(),
                Some("true".to_string()),
            );
            conf.insert(
                "spark.dynamicAllocation.shuffleTracking.enabled".to_string(),
                Some("true".to_string()),
            );
        }

        if self.charm_config.profile == Profile::Testing {
            conf.insert(
                "spark.kubernetes.executor.request.cores".to_string(),
                Some("0.1".to_string()),
            );
        }

        conf
    }

    fn service_account_conf(&self) -> BTreeMap<String, Option<String>> {
        let Some(account) = self.service_account else {
            return BTreeMap::new();
        };

        let mut conf = BTreeMap::from([
            (SPARK_NAMESPACE.to_string(), Some(account.namespace.clone())),
            (
                SPARK_DRIVER_SERVICE_ACCOUNT.to_string(),
                Some(account.service_account.clone()),
            ),
        ]);
        conf.extend(
            account
                .spark_properties
                .iter()
                .map(|(key, value)| (key.clone(), Some(value.clone()))),
        );
        conf
    }

    fn s3_conf(&self) -> BTreeMap<String, Option<String>> {
        let Some(s3) = self.s3 else {
            return BTreeMap::new();
        };

        let ssl_enabled = s3
            .endpoint
            .as_deref()
            .is_some_and(|endpoint| endpoint.starts_with("https://"));
        BTreeMap::from([
            (
                "spark.hadoop.fs.s3a.aws.credentials.provider".to_string(),
                Some("org.apache.hadoop.fs.s3a.SimpleAWSCredentialsProvider".to_string()),
            ),
            (
                "spark.hadoop.fs.s3a.connection.ssl.enabled".to_string(),
                Some(ssl_enabled.to_string()),
            ),
            (
                "spark.hadoop.fs.s3a.path.style.access".to_string(),
                Some("true".to_string()),
            ),
            ("spark.hadoop.fs.s3a.endpoint".to_string(), s3.endpoint.clone()),
            (
                "spark.hadoop.fs.s3a.access.key".to_string(),
                Some(s3.access_key.clone()),
            ),
            (
                "spark.hadoop.fs.s3a.secret.key".to_string(),
                Some(s3.secret_key.clone()),
            ),
            (SPARK_WAREHOUSE_DIR.to_string(), Some(s3.warehouse_dir())),
            (SPARK_FILE_UPLOAD_PATH.to_string(), Some(s3.log_dir())),
        ])
    }

    fn iceberg_conf(&self, warehouse: Option<&str>) -> BTreeMap<String, Option<String>> {
        let Some(warehouse) = warehouse.filter(|warehouse| !warehouse.is_empty()) else {
            return BTreeMap::new();
        };

        let catalog = &self.charm_config.iceberg_catalog_name;
        let catalog_class = if catalog == SPARK_DEFAULT_CATALOG_NAME {
            "org.apache.iceberg.spark.SparkSessionCatalog"
        } else {
            "org.apache.iceberg.spark.SparkCatalog"
        };
        let catalog_type = if self.metastore_db.is_some() {
            "hive"
        } else {
            "hadoop"
        };

        BTreeMap::from([
            (
                SPARK_SQL_EXTENSIONS.to_string(),
                Some(ICEBERG_EXTENSIONS.to_string()),
            ),
            (
                format!("spark.sql.catalog.{catalog}"),
                Some(catalog_class.to_string()),
            ),
            (
                format!("spark.sql.catalog.{catalog}.warehouse"),
                Some(warehouse.to_string()),
            ),
            (
                format!("spark.sql.catalog.{catalog}.type"),
                Some(catalog_type.to_string()),
            ),
        ])
    }

    /// Merged properties. Service account properties override the defaults and S3
    /// settings override both.
    pub fn properties(&self) -> BTreeMap<String, Option<String>> {
        let mut conf = self.base_conf();
        conf.extend(self.service_account_conf());
        conf.extend(self.s3_conf());

        let warehouse = conf.get(SPARK_WAREHOUSE_DIR).cloned().flatten();
        conf.extend(self.iceberg_conf(warehouse.as_deref()));
        conf
    }

    pub fn render(&self) -> Result<String> {
        to_properties(SPARK_DEFAULTS_CONF, self.properties())
    }
}
