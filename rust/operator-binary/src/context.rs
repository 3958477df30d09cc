//! Read-through view of the Juju model.
//!
//! Nothing is cached: every accessor reads the current relation data, so two calls in
//! the same hook can observe a write made in between.

use crate::{
    charm::{
        CharmConfig, AUTH_DB_REL, CLIENT_REL, DEFAULT_ADMIN_USERNAME, METASTORE_DB_REL, PEER_REL,
        S3_REL, SERVICE_ACCOUNT_REL, TLS_REL, ZOOKEEPER_REL,
    },
    domain::{
        DatabaseConnectionInfo, KyuubiCluster, KyuubiServer, S3ConnectionInfo,
        ServiceAccountInfo, TlsState, ZookeeperInfo,
    },
    juju::{self, Bag, Databag, Model, Relation, SecretLookup},
    managers::{kyuubi::KyuubiInputs, tls},
    status::SecretState,
};

/// Key under which data-platform providers share credentials through a Juju secret.
const SECRET_USER_KEY: &str = "secret-user";
const TLS_SECRET_KEY: &str = "private-key";

pub struct Context<'a> {
    model: &'a dyn Model,
    pub config: CharmConfig,
    /// The relation a `-relation-broken` hook is running for. Juju still lists it.
    departing: Option<Relation>,
}

impl<'a> Context<'a> {
    pub fn new(model: &'a dyn Model, config: CharmConfig) -> Self {
        Self {
            model,
            config,
            departing: None,
        }
    }

    /// Hides `relation` from every accessor.
    pub fn without(mut self, relation: Relation) -> Self {
        self.departing = Some(relation);
        self
    }

    pub fn model(&self) -> &'a dyn Model {
        self.model
    }

    /// Namespace Spark jobs run in when the integration hub does not say otherwise.
    pub fn namespace(&self) -> &str {
        self.config.effective_namespace(self.model.model_name())
    }

    pub async fn relations(&self, endpoint: &str) -> juju::Result<Vec<Relation>> {
        let relations = self.model.relations(endpoint).await?;
        Ok(relations
            .into_iter()
            .filter(|relation| {
                self.departing.as_ref().map_or(true, |departing| {
                    departing.endpoint != relation.endpoint || departing.id != relation.id
                })
            })
            .collect())
    }

    pub async fn relation(&self, endpoint: &str) -> juju::Result<Option<Relation>> {
        Ok(self.relations(endpoint).await?.into_iter().next())
    }

    async fn remote_app_data(&self, endpoint: &str) -> juju::Result<Option<(Relation, Databag)>> {
        let Some(relation) = self.relation(endpoint).await? else {
            return Ok(None);
        };
        let data = self.model.read(&relation, &Bag::RemoteApp).await?;
        Ok(Some((relation, data)))
    }

    /// Content of the `secret-user` secret a provider may share credentials through.
    async fn shared_secret(&self, data: &Databag) -> juju::Result<Option<Databag>> {
        let Some(uri) = data.get(SECRET_USER_KEY).filter(|uri| !uri.is_empty()) else {
            return Ok(None);
        };
        match self.model.secret_by_id(uri).await? {
            SecretLookup::Content(content) => Ok(Some(content)),
            lookup => {
                tracing::warn!(?lookup, "credentials secret of a provider is not readable");
                Ok(None)
            }
        }
    }

    pub async fn s3(&self) -> juju::Result<Option<S3ConnectionInfo>> {
        Ok(self
            .remote_app_data(S3_REL)
            .await?
            .and_then(|(_, data)| S3ConnectionInfo::from_databag(&data)))
    }

    async fn database(&self, endpoint: &str) -> juju::Result<Option<DatabaseConnectionInfo>> {
        let Some((_, data)) = self.remote_app_data(endpoint).await? else {
            return Ok(None);
        };
        let secret = self.shared_secret(&data).await?;
        Ok(DatabaseConnectionInfo::from_databag(&data, secret.as_ref()))
    }

    pub async fn metastore_db(&self) -> juju::Result<Option<DatabaseConnectionInfo>> {
        self.database(METASTORE_DB_REL).await
    }

    pub async fn auth_db(&self) -> juju::Result<Option<DatabaseConnectionInfo>> {
        self.database(AUTH_DB_REL).await
    }

    pub async fn is_authentication_enabled(&self) -> juju::Result<bool> {
        Ok(self.auth_db().await?.is_some())
    }

    pub async fn service_account(&self) -> juju::Result<Option<ServiceAccountInfo>> {
        let namespace = self.namespace().to_string();
        Ok(self
            .remote_app_data(SERVICE_ACCOUNT_REL)
            .await?
            .and_then(|(_, data)| ServiceAccountInfo::from_databag(&data, &namespace)))
    }

    pub async fn zookeeper_relation_exists(&self) -> juju::Result<bool> {
        Ok(self.relation(ZOOKEEPER_REL).await?.is_some())
    }

    pub async fn zookeeper(&self) -> juju::Result<Option<ZookeeperInfo>> {
        let Some((_, mut data)) = self.remote_app_data(ZOOKEEPER_REL).await? else {
            return Ok(None);
        };
        if let Some(secret) = self.shared_secret(&data).await? {
            for (key, value) in secret {
                data.entry(key).or_insert(value);
            }
        }
        Ok(ZookeeperInfo::from_databag(&data))
    }

    pub async fn tls_relation_exists(&self) -> juju::Result<bool> {
        Ok(self.relation(TLS_REL).await?.is_some())
    }

    pub async fn client_relations(&self) -> juju::Result<Vec<Relation>> {
        self.relations(CLIENT_REL).await
    }

    pub async fn peer_relation(&self) -> juju::Result<Option<Relation>> {
        self.model.relations(PEER_REL).await.map(|relations| relations.into_iter().next())
    }

    async fn peer_data(&self, bag: Bag) -> juju::Result<Databag> {
        match self.peer_relation().await? {
            Some(relation) => self.model.read(&relation, &bag).await,
            None => Ok(Databag::new()),
        }
    }

    async fn update_peer_data(&self, bag: Bag, changes: &[(&str, &str)]) -> juju::Result<()> {
        let Some(relation) = self.peer_relation().await? else {
            tracing::debug!(?bag, "peer relation not established yet, dropping update");
            return Ok(());
        };
        let changes = changes
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<Databag>();
        self.model.write(&relation, &bag, &changes).await
    }

    pub async fn unit_server(&self) -> juju::Result<KyuubiServer> {
        Ok(KyuubiServer::from_databag(&self.peer_data(Bag::LocalUnit).await?))
    }

    pub async fn cluster(&self) -> juju::Result<KyuubiCluster> {
        Ok(KyuubiCluster::from_databag(&self.peer_data(Bag::LocalApp).await?))
    }

    /// Writes into this unit's peer databag. Empty values remove the key.
    pub async fn update_unit_server(&self, changes: &[(&str, &str)]) -> juju::Result<()> {
        self.update_peer_data(Bag::LocalUnit, changes).await
    }

    /// Writes into the application peer databag. Leader only.
    pub async fn update_cluster(&self, changes: &[(&str, &str)]) -> juju::Result<()> {
        self.update_peer_data(Bag::LocalApp, changes).await
    }

    /// Number of units that joined the peer relation, this one included.
    pub async fn peer_units(&self) -> juju::Result<u32> {
        let others = match self.peer_relation().await? {
            Some(relation) => self.model.relation_units(&relation).await?.len(),
            None => 0,
        };
        Ok(others as u32 + 1)
    }

    pub async fn tls_state(&self) -> juju::Result<TlsState> {
        Ok(TlsState::resolve(
            &self.cluster().await?,
            &self.unit_server().await?,
        ))
    }

    async fn configured_secret(&self, uri: Option<&str>) -> juju::Result<Option<SecretLookup>> {
        match uri.filter(|uri| !uri.is_empty()) {
            Some(uri) => self.model.secret_by_id(uri).await.map(Some),
            None => Ok(None),
        }
    }

    /// The `system-users` secret, which must hold a non-empty `admin` password.
    pub async fn system_users_secret(&self) -> juju::Result<SecretState> {
        Ok(
            match self
                .configured_secret(self.config.system_users.as_deref())
                .await?
            {
                None => SecretState::NotConfigured,
                // a secret the charm was not granted is indistinguishable from a missing one
                Some(SecretLookup::NotFound | SecretLookup::Forbidden) => SecretState::DoesNotExist,
                Some(SecretLookup::Content(mut content)) => {
                    match content
                        .remove(DEFAULT_ADMIN_USERNAME)
                        .filter(|password| !password.is_empty())
                    {
                        Some(password) => SecretState::Valid(password),
                        None => SecretState::Invalid,
                    }
                }
            },
        )
    }

    /// The `tls-client-private-key` secret, whose `private-key` must be a usable RSA key.
    pub async fn tls_secret(&self) -> juju::Result<SecretState> {
        Ok(
            match self
                .configured_secret(self.config.tls_client_private_key.as_deref())
                .await?
            {
                None => SecretState::NotConfigured,
                Some(SecretLookup::NotFound | SecretLookup::Forbidden) => SecretState::DoesNotExist,
                Some(SecretLookup::Content(content)) => {
                    match content.get(TLS_SECRET_KEY).map(|key| tls::parse_private_key(key)) {
                        Some(Ok(key)) => SecretState::Valid(key),
                        Some(Err(error)) => {
                            tracing::warn!(%error, "tls-client-private-key holds no usable key");
                            SecretState::Invalid
                        }
                        None => SecretState::Invalid,
                    }
                }
            },
        )
    }

    /// Key the operator asked every unit to use: the configured secret first, then the
    /// key stored by the leader.
    pub async fn operator_private_key(&self) -> juju::Result<Option<String>> {
        if let SecretState::Valid(key) = self.tls_secret().await? {
            return Ok(Some(key));
        }
        Ok(self.cluster().await?.private_key)
    }

    pub async fn kyuubi_inputs(&self, api_server: String) -> juju::Result<KyuubiInputs> {
        Ok(KyuubiInputs {
            charm_config: self.config.clone(),
            api_server,
            s3: self.s3().await?,
            metastore_db: self.metastore_db().await?,
            auth_db: self.auth_db().await?,
            service_account: self.service_account().await?,
            zookeeper: self.zookeeper().await?,
            tls: self.tls_state().await?,
            allowed_to_start: self.cluster().await?.refresh_incompatible.is_none(),
        })
    }
}
