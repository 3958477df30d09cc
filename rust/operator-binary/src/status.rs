//! The one status a unit reports, derived from scratch on every hook.

use std::fmt;

use async_trait::async_trait;
use strum::Display;

use crate::managers::k8s::Lookup;

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Maintenance,
    Waiting,
    Blocked,
    Active,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CharmStatus {
    WaitingPebble,
    MissingObjectStorageBackend,
    InvalidCredentials,
    MissingIntegrationHub,
    InsufficientClusterPermissions,
    InvalidNamespace,
    InvalidServiceAccount,
    SystemUsersSecretDoesNotExist,
    SystemUsersSecretInvalid,
    TlsSecretDoesNotExist,
    TlsSecretInvalid,
    WaitingZookeeper,
    MissingZookeeper,
    InvalidMetastoreSchema,
    UpgradeIncompatible(String),
    WaitingForService,
    NotServingRequests,
    Active,
}

impl CharmStatus {
    pub fn severity(&self) -> Severity {
        match self {
            CharmStatus::WaitingPebble | CharmStatus::WaitingZookeeper => Severity::Maintenance,
            CharmStatus::WaitingForService | CharmStatus::NotServingRequests => Severity::Waiting,
            CharmStatus::Active => Severity::Active,
            _ => Severity::Blocked,
        }
    }

    pub fn is_active(&self) -> bool {
        *self == CharmStatus::Active
    }
}

impl fmt::Display for CharmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            CharmStatus::WaitingPebble => "Waiting for Pebble",
            CharmStatus::MissingObjectStorageBackend => "Missing Object Storage backend",
            CharmStatus::InvalidCredentials => "Invalid S3 credentials",
            CharmStatus::MissingIntegrationHub => "Missing integration hub relation",
            CharmStatus::InsufficientClusterPermissions => {
                "Insufficient cluster permissions. Try: juju trust --scope=cluster <app-name>"
            }
            CharmStatus::InvalidNamespace => "Invalid config option: namespace",
            CharmStatus::InvalidServiceAccount => "Invalid config option: service-account",
            CharmStatus::SystemUsersSecretDoesNotExist => {
                "The secret configured as system-users does not exist"
            }
            CharmStatus::SystemUsersSecretInvalid => {
                "The secret configured as system-users is invalid"
            }
            CharmStatus::TlsSecretDoesNotExist => {
                "The secret configured as tls-client-private-key does not exist"
            }
            CharmStatus::TlsSecretInvalid => {
                "The secret configured as tls-client-private-key is invalid"
            }
            CharmStatus::WaitingZookeeper => "Waiting for zookeeper credentials",
            CharmStatus::MissingZookeeper => {
                "Missing Zookeeper integration (which is required when there are more than one units of Kyuubi)"
            }
            CharmStatus::InvalidMetastoreSchema => {
                "Invalid metastore schema: please run the initialization manually"
            }
            CharmStatus::UpgradeIncompatible(reason) => {
                return write!(f, "Refresh incompatible: {reason}")
            }
            CharmStatus::WaitingForService => "Waiting for K8s service to be available",
            CharmStatus::NotServingRequests => "Kyuubi is not serving requests",
            CharmStatus::Active => "",
        };
        f.write_str(message)
    }
}

/// State of an operator supplied secret referenced from the charm config.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SecretState {
    NotConfigured,
    DoesNotExist,
    Invalid,
    Valid(String),
}

/// The observations the status chain is evaluated over. Every probe is only invoked
/// once all checks before it have passed.
#[async_trait]
pub trait StatusProbes: Send + Sync {
    async fn workload_ready(&self) -> bool;

    async fn s3_present(&self) -> bool;

    async fn s3_credentials_valid(&self) -> bool;

    async fn service_account_present(&self) -> bool;

    async fn namespace(&self) -> Lookup;

    async fn service_account(&self) -> Lookup;

    async fn system_users_secret(&self) -> SecretState;

    async fn tls_secret(&self) -> SecretState;

    async fn zookeeper_relation_exists(&self) -> bool;

    async fn zookeeper_present(&self) -> bool;

    async fn planned_units(&self) -> u32;

    /// `None` without an external metastore.
    async fn metastore_valid(&self) -> Option<bool>;

    async fn refresh_incompatible(&self) -> Option<String>;

    async fn service_address(&self) -> String;

    async fn serving_requests(&self) -> bool;
}

/// Walks the precondition chain and returns the first failure, or [`CharmStatus::Active`].
pub async fn derive_status(probes: &dyn StatusProbes) -> CharmStatus {
    if !probes.workload_ready().await {
        return CharmStatus::WaitingPebble;
    }
    if !probes.s3_present().await {
        return CharmStatus::MissingObjectStorageBackend;
    }
    if !probes.s3_credentials_valid().await {
        return CharmStatus::InvalidCredentials;
    }
    if !probes.service_account_present().await {
        return CharmStatus::MissingIntegrationHub;
    }

    match probes.namespace().await {
        Lookup::Forbidden => return CharmStatus::InsufficientClusterPermissions,
        Lookup::Missing => return CharmStatus::InvalidNamespace,
        Lookup::Found => {}
    }
    match probes.service_account().await {
        Lookup::Forbidden => return CharmStatus::InsufficientClusterPermissions,
        Lookup::Missing => return CharmStatus::InvalidServiceAccount,
        Lookup::Found => {}
    }

    match probes.system_users_secret().await {
        SecretState::DoesNotExist => return CharmStatus::SystemUsersSecretDoesNotExist,
        SecretState::Invalid => return CharmStatus::SystemUsersSecretInvalid,
        SecretState::NotConfigured | SecretState::Valid(_) => {}
    }
    match probes.tls_secret().await {
        SecretState::DoesNotExist => return CharmStatus::TlsSecretDoesNotExist,
        SecretState::Invalid => return CharmStatus::TlsSecretInvalid,
        SecretState::NotConfigured | SecretState::Valid(_) => {}
    }

    let zookeeper_present = probes.zookeeper_present().await;
    if probes.zookeeper_relation_exists().await && !zookeeper_present {
        return CharmStatus::WaitingZookeeper;
    }
    if probes.planned_units().await > 1 && !zookeeper_present {
        return CharmStatus::MissingZookeeper;
    }

    if probes.metastore_valid().await == Some(false) {
        return CharmStatus::InvalidMetastoreSchema;
    }
    if let Some(reason) = probes.refresh_incompatible().await {
        return CharmStatus::UpgradeIncompatible(reason);
    }
    if probes.service_address().await.is_empty() {
        return CharmStatus::WaitingForService;
    }
    if !probes.serving_requests().await {
        return CharmStatus::NotServingRequests;
    }
    CharmStatus::Active
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use rstest::rstest;

    use super::*;

    /// Probes answering from plain fields, all passing by default.
    #[derive(Clone)]
    struct Probes {
        workload_ready: bool,
        s3_present: bool,
        s3_valid: bool,
        hub: bool,
        namespace: Lookup,
        service_account: Lookup,
        system_users: SecretState,
        tls_secret: SecretState,
        zookeeper_relation: bool,
        zookeeper: bool,
        planned_units: u32,
        metastore_valid: Option<bool>,
        refresh_incompatible: Option<String>,
        service_address: String,
        serving: bool,
        service_account_lookups: Arc<AtomicUsize>,
    }

    impl Default for Probes {
        fn default() -> Self {
            Self {
                workload_ready: true,
                s3_present: true,
                s3_valid: true,
                hub: true,
                namespace: Lookup::Found,
                service_account: Lookup::Found,
                system_users: SecretState::NotConfigured,
                tls_secret: SecretState::NotConfigured,
                zookeeper_relation: false,
                zookeeper: false,
                planned_units: 1,
                metastore_valid: None,
                refresh_incompatible: None,
                service_address: "kyuubi-k8s-service.model.svc.cluster.local:10009".to_string(),
                serving: true,
                service_account_lookups: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl StatusProbes for Probes {
        async fn workload_ready(&self) -> bool {
            self.workload_ready
        }

        async fn s3_present(&self) -> bool {
            self.s3_present
        }

        async fn s3_credentials_valid(&self) -> bool {
            self.s3_valid
        }

        async fn service_account_present(&self) -> bool {
            self.hub
        }

        async fn namespace(&self) -> Lookup {
            self.namespace
        }

        async fn service_account(&self) -> Lookup {
            self.service_account_lookups.fetch_add(1, Ordering::SeqCst);
            self.service_account
        }

        async fn system_users_secret(&self) -> SecretState {
            self.system_users.clone()
        }

        async fn tls_secret(&self) -> SecretState {
            self.tls_secret.clone()
        }

        async fn zookeeper_relation_exists(&self) -> bool {
            self.zookeeper_relation
        }

        async fn zookeeper_present(&self) -> bool {
            self.zookeeper
        }

        async fn planned_units(&self) -> u32 {
            self.planned_units
        }

        async fn metastore_valid(&self) -> Option<bool> {
            self.metastore_valid
        }

        async fn refresh_incompatible(&self) -> Option<String> {
            self.refresh_incompatible.clone()
        }

        async fn service_address(&self) -> String {
            self.service_address.clone()
        }

        async fn serving_requests(&self) -> bool {
            self.serving
        }
    }

    #[tokio::test]
    async fn test_everything_in_place_is_active() {
        let status = derive_status(&Probes::default()).await;
        assert_eq!(status, CharmStatus::Active);
        assert_eq!(status.severity().to_string(), "active");
        assert_eq!(status.to_string(), "");
    }

    #[rstest]
    #[case::pebble_before_s3(
        Probes { workload_ready: false, s3_present: false, ..Probes::default() },
        CharmStatus::WaitingPebble
    )]
    #[case::missing_s3_before_hub(
        Probes { s3_present: false, hub: false, ..Probes::default() },
        CharmStatus::MissingObjectStorageBackend
    )]
    #[case::credentials_before_hub(
        Probes { s3_valid: false, hub: false, ..Probes::default() },
        CharmStatus::InvalidCredentials
    )]
    #[case::hub_before_namespace(
        Probes { hub: false, namespace: Lookup::Missing, ..Probes::default() },
        CharmStatus::MissingIntegrationHub
    )]
    #[case::forbidden_namespace(
        Probes {
            namespace: Lookup::Forbidden,
            service_account: Lookup::Missing,
            ..Probes::default()
        },
        CharmStatus::InsufficientClusterPermissions
    )]
    #[case::forbidden_service_account(
        Probes { service_account: Lookup::Forbidden, ..Probes::default() },
        CharmStatus::InsufficientClusterPermissions
    )]
    #[case::namespace_before_service_account(
        Probes {
            namespace: Lookup::Missing,
            service_account: Lookup::Missing,
            ..Probes::default()
        },
        CharmStatus::InvalidNamespace
    )]
    #[case::service_account_before_secrets(
        Probes {
            service_account: Lookup::Missing,
            system_users: SecretState::Invalid,
            ..Probes::default()
        },
        CharmStatus::InvalidServiceAccount
    )]
    #[case::system_users_before_tls_secret(
        Probes {
            system_users: SecretState::DoesNotExist,
            tls_secret: SecretState::Invalid,
            ..Probes::default()
        },
        CharmStatus::SystemUsersSecretDoesNotExist
    )]
    #[case::tls_secret_before_zookeeper(
        Probes { tls_secret: SecretState::DoesNotExist, planned_units: 3, ..Probes::default() },
        CharmStatus::TlsSecretDoesNotExist
    )]
    #[case::waiting_zookeeper_before_missing(
        Probes { zookeeper_relation: true, planned_units: 3, ..Probes::default() },
        CharmStatus::WaitingZookeeper
    )]
    #[case::zookeeper_before_metastore(
        Probes { planned_units: 2, metastore_valid: Some(false), ..Probes::default() },
        CharmStatus::MissingZookeeper
    )]
    #[case::metastore_before_refresh(
        Probes {
            metastore_valid: Some(false),
            refresh_incompatible: Some("1.10.2 to 1.9.0".to_string()),
            ..Probes::default()
        },
        CharmStatus::InvalidMetastoreSchema
    )]
    #[case::refresh_before_service(
        Probes {
            refresh_incompatible: Some("1.10.2 to 1.9.0".to_string()),
            service_address: String::new(),
            ..Probes::default()
        },
        CharmStatus::UpgradeIncompatible("1.10.2 to 1.9.0".to_string())
    )]
    #[case::service_before_serving(
        Probes { service_address: String::new(), serving: false, ..Probes::default() },
        CharmStatus::WaitingForService
    )]
    #[case::not_serving(
        Probes { serving: false, ..Probes::default() },
        CharmStatus::NotServingRequests
    )]
    #[tokio::test]
    async fn test_earlier_failure_wins(#[case] probes: Probes, #[case] expected: CharmStatus) {
        assert_eq!(derive_status(&probes).await, expected);
    }

    #[tokio::test]
    async fn test_missing_namespace_skips_service_account_lookup() {
        let probes = Probes {
            namespace: Lookup::Missing,
            service_account: Lookup::Forbidden,
            ..Probes::default()
        };
        assert_eq!(derive_status(&probes).await, CharmStatus::InvalidNamespace);
        assert_eq!(probes.service_account_lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_unit_with_zookeeper_is_fine() {
        let probes = Probes {
            zookeeper_relation: true,
            zookeeper: true,
            planned_units: 3,
            ..Probes::default()
        };
        assert_eq!(derive_status(&probes).await, CharmStatus::Active);
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            CharmStatus::UpgradeIncompatible("1.10.2 to 1.9.0".to_string()).to_string(),
            "Refresh incompatible: 1.10.2 to 1.9.0"
        );
        assert_eq!(CharmStatus::WaitingPebble.severity(), Severity::Maintenance);
        assert_eq!(CharmStatus::NotServingRequests.severity(), Severity::Waiting);
        assert_eq!(CharmStatus::InvalidCredentials.severity().to_string(), "blocked");
    }
}
