//! Raw SQL execution against the PostgreSQL databases Kyuubi is related to.

use async_trait::async_trait;
use sqlx::{
    Executor,
    postgres::{PgConnectOptions, PgRow},
    Connection, PgConnection, Row as _,
};

use crate::{charm::POSTGRESQL_DEFAULT_DATABASE, domain::DatabaseConnectionInfo};

/// One result row with every column decoded as text.
pub type Row = Vec<Option<String>>;

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Runs `query` with `params` bound as text against `database`, or against the
    /// database of the connection info when `None`.
    ///
    /// Never fails: any error is logged and reported as `(false, [])`.
    async fn execute(
        &self,
        query: &str,
        params: &[&str],
        database: Option<&str>,
    ) -> (bool, Vec<Row>);

    /// Whether the server accepts our credentials.
    async fn verify(&self) -> bool {
        self.execute("SELECT 1", &[], Some(POSTGRESQL_DEFAULT_DATABASE))
            .await
            .0
    }
}

/// Builds an executor for a given set of credentials.
pub trait DatabaseConnector: Send + Sync {
    fn connect(&self, info: &DatabaseConnectionInfo) -> Box<dyn SqlExecutor>;
}

pub struct PostgresConnector;

impl DatabaseConnector for PostgresConnector {
    fn connect(&self, info: &DatabaseConnectionInfo) -> Box<dyn SqlExecutor> {
        Box::new(DatabaseManager::new(info.clone()))
    }
}

/// [`SqlExecutor`] opening a fresh connection for every statement.
pub struct DatabaseManager {
    info: DatabaseConnectionInfo,
}

impl DatabaseManager {
    pub fn new(info: DatabaseConnectionInfo) -> Self {
        Self { info }
    }

    fn connect_options(&self, database: &str) -> PgConnectOptions {
        let (host, port) = self.info.primary_host_port();
        PgConnectOptions::new()
            .host(&host)
            .port(port)
            .username(&self.info.username)
            .password(&self.info.password)
            .database(database)
    }

    async fn run(
        connection: &mut PgConnection,
        query: &str,
        params: &[&str],
    ) -> Result<Vec<Row>, sqlx::Error> {
        // statements without parameters go through the simple query protocol so that
        // DDL like DROP DATABASE is not wrapped in a prepared statement
        let rows = if params.is_empty() {
            connection.fetch_all(sqlx::raw_sql(query)).await?
        } else {
            connection
                .fetch_all(
                    params
                        .iter()
                        .fold(sqlx::query(query), |query, param| query.bind(*param)),
                )
                .await?
        };
        Ok(rows.iter().map(decode_row).collect())
    }
}

fn decode_row(row: &PgRow) -> Row {
    (0..row.len())
        .map(|index| {
            row.try_get::<Option<String>, _>(index)
                .or_else(|_| {
                    row.try_get::<Option<i32>, _>(index)
                        .map(|v| v.map(|v| v.to_string()))
                })
                .or_else(|_| {
                    row.try_get::<Option<i64>, _>(index)
                        .map(|v| v.map(|v| v.to_string()))
                })
                .or_else(|_| {
                    row.try_get::<Option<bool>, _>(index)
                        .map(|v| v.map(|v| v.to_string()))
                })
                .unwrap_or_default()
        })
        .collect()
}

#[async_trait]
impl SqlExecutor for DatabaseManager {
    async fn execute(
        &self,
        query: &str,
        params: &[&str],
        database: Option<&str>,
    ) -> (bool, Vec<Row>) {
        let database = database.unwrap_or(&self.info.dbname);
        let mut connection = match PgConnection::connect_with(&self.connect_options(database)).await
        {
            Ok(connection) => connection,
            Err(error) => {
                tracing::warn!(%error, database, "failed to connect to PostgreSQL");
                return (false, Vec::new());
            }
        };

        let result = Self::run(&mut connection, query, params).await;
        if let Err(error) = connection.close().await {
            tracing::debug!(%error, database, "failed to close PostgreSQL connection");
        }

        match result {
            Ok(rows) => (true, rows),
            Err(error) => {
                tracing::warn!(%error, database, "query failed");
                (false, Vec::new())
            }
        }
    }
}
