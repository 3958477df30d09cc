//! User accounts of Kyuubi's JDBC authentication.
//!
//! Password hashes live in the `kyuubi_users` table of the authentication database and
//! are computed by PostgreSQL's `pgcrypto`. The plaintext is mirrored into the peer
//! application secret so that actions can hand it back to the operator.

use snafu::{ensure, ResultExt, Snafu};

use crate::{
    charm::{
        AUTHENTICATION_TABLE_NAME, DEFAULT_ADMIN_USERNAME, PEER_REL, POSTGRESQL_DEFAULT_DATABASE,
    },
    juju::{self, Databag, Model},
    managers::database::SqlExecutor,
    workload::generate_password,
};

pub const PASSWORD_LENGTH: usize = 16;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to prepare the authentication database: {statement}"))]
    PrepareDatabase { statement: String },

    #[snafu(display("failed to create user {username}"))]
    CreateUser { username: String },

    #[snafu(display("failed to update the password of {username}"))]
    SetPassword { username: String },

    #[snafu(display("failed to access the peer secret"))]
    PeerSecret { source: juju::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Username handed out to the client application of a `jdbc` relation.
pub fn relation_username(relation_id: u32) -> String {
    format!("relation_id_{relation_id}")
}

/// Label of the application secret the plaintext passwords are mirrored into.
pub fn peer_secret_label(app_name: &str) -> String {
    format!("{PEER_REL}.{app_name}.app")
}

fn password_key(username: &str) -> String {
    format!("{}-password", username.replace('_', "-"))
}

pub struct AuthManager<'a> {
    database: &'a dyn SqlExecutor,
    model: &'a dyn Model,
}

impl<'a> AuthManager<'a> {
    pub fn new(database: &'a dyn SqlExecutor, model: &'a dyn Model) -> Self {
        Self { database, model }
    }

    fn secret_label(&self) -> String {
        peer_secret_label(self.model.app_name())
    }

    async fn run(&self, statement: &str) -> Result<()> {
        let (ok, _) = self.database.execute(statement, &[], None).await;
        ensure!(ok, PrepareDatabaseSnafu { statement });
        Ok(())
    }

    /// Creates the extension, the users table and the `admin` account. Safe to call
    /// repeatedly; an existing `admin` keeps its password.
    pub async fn prepare(&self, admin_password: Option<String>) -> Result<()> {
        tracing::info!("preparing the authentication database");
        self.run("CREATE EXTENSION IF NOT EXISTS pgcrypto").await?;
        self.run(&format!(
            "CREATE TABLE IF NOT EXISTS {AUTHENTICATION_TABLE_NAME} (\
             id SERIAL PRIMARY KEY, \
             username VARCHAR(100) UNIQUE NOT NULL, \
             passwd VARCHAR(255) NOT NULL)"
        ))
        .await?;

        if self.user_exists(DEFAULT_ADMIN_USERNAME).await {
            tracing::info!("admin user already exists");
            return Ok(());
        }
        let password = admin_password.unwrap_or_else(|| generate_password(PASSWORD_LENGTH));
        self.create_user(DEFAULT_ADMIN_USERNAME, &password).await
    }

    pub async fn create_user(&self, username: &str, password: &str) -> Result<()> {
        tracing::info!(username, "creating user");
        let (ok, _) = self
            .database
            .execute(
                &format!(
                    "INSERT INTO {AUTHENTICATION_TABLE_NAME} (username, passwd) \
                     VALUES ($1, crypt($2, gen_salt('bf')))"
                ),
                &[username, password],
                None,
            )
            .await;
        ensure!(ok, CreateUserSnafu { username });

        self.mirror_password(username, Some(password)).await
    }

    /// Removes the user. Deleting a user that does not exist is not an error.
    pub async fn delete_user(&self, username: &str) -> Result<()> {
        tracing::info!(username, "deleting user");
        let (ok, _) = self
            .database
            .execute(
                &format!("DELETE FROM {AUTHENTICATION_TABLE_NAME} WHERE username = $1"),
                &[username],
                None,
            )
            .await;
        if !ok {
            tracing::warn!(username, "failed to delete user");
        }
        self.mirror_password(username, None).await
    }

    pub async fn user_exists(&self, username: &str) -> bool {
        let (ok, rows) = self
            .database
            .execute(
                &format!("SELECT 1 FROM {AUTHENTICATION_TABLE_NAME} WHERE username = $1"),
                &[username],
                None,
            )
            .await;
        if !ok {
            tracing::warn!(username, "could not check whether user exists");
        }
        ok && !rows.is_empty()
    }

    /// The plaintext password, as mirrored into the peer secret.
    pub async fn get_password(&self, username: &str) -> Result<Option<String>> {
        let content = self
            .model
            .secret_by_label(&self.secret_label())
            .await
            .context(PeerSecretSnafu)?;
        Ok(content.and_then(|mut content| content.remove(&password_key(username))))
    }

    /// Re-hashes the password of an existing user and updates the mirror. Fails when
    /// no row was updated.
    pub async fn set_password(&self, username: &str, password: &str) -> Result<()> {
        tracing::info!(username, "updating password");
        let (ok, rows) = self
            .database
            .execute(
                &format!(
                    "UPDATE {AUTHENTICATION_TABLE_NAME} SET passwd = crypt($2, gen_salt('bf')) \
                     WHERE username = $1 RETURNING id"
                ),
                &[username, password],
                None,
            )
            .await;
        ensure!(ok && !rows.is_empty(), SetPasswordSnafu { username });

        self.mirror_password(username, Some(password)).await
    }

    /// Drops the whole authentication database. Runs against the default database
    /// because PostgreSQL refuses to drop the database a session is connected to.
    pub async fn remove_auth_db(&self, dbname: &str) -> bool {
        tracing::info!(dbname, "removing the authentication database");
        let (ok, _) = self
            .database
            .execute(
                &format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", dbname.replace('"', "")),
                &[],
                Some(POSTGRESQL_DEFAULT_DATABASE),
            )
            .await;
        if !ok {
            tracing::warn!(dbname, "failed to drop the authentication database");
        }
        ok
    }

    async fn mirror_password(&self, username: &str, password: Option<&str>) -> Result<()> {
        let label = self.secret_label();
        let mut content: Databag = self
            .model
            .secret_by_label(&label)
            .await
            .context(PeerSecretSnafu)?
            .unwrap_or_default();

        let key = password_key(username);
        let changed = match password {
            Some(password) => {
                content.insert(key, password.to_string()).as_deref() != Some(password)
            }
            None => content.remove(&key).is_some(),
        };
        if !changed {
            return Ok(());
        }
        if content.is_empty() {
            // a secret cannot be emptied, an orphaned value is harmless
            tracing::debug!(username, "keeping last entry of the peer secret");
            return Ok(());
        }
        self.model
            .set_secret(&label, &content)
            .await
            .context(PeerSecretSnafu)
    }
}
