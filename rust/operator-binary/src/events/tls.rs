//! The `certificates` relation, following the `tls-certificates` v2 interface.
//!
//! A unit publishes one signing request at a time in its databag; the provider answers
//! with a list of issued certificates in its application databag. A certificate is only
//! installed when it answers the request the unit currently has outstanding.

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::{
    provider, Charm, ModelSnafu, Outcome, RelationEventKind, Result, SerializeRelationDataSnafu,
    TlsSnafu, WorkloadSnafu,
};
use crate::{
    charm::{ExposeExternal, KEYSTORE_PATH, PEER_REL, TLS_REL},
    context::Context,
    domain::{cluster_keys, unit_keys, TLS_ENABLED},
    juju::{Bag, Databag, Relation},
    managers::{
        auth::PASSWORD_LENGTH,
        kyuubi::UpdateOptions,
        tls::{self, TlsManager, UnitAddresses, EXPIRY_NOTICE_DAYS},
    },
    workload::generate_password,
};

const REQUESTS_KEY: &str = "certificate_signing_requests";
const CERTIFICATES_KEY: &str = "certificates";

#[derive(Debug, Deserialize, Serialize)]
struct CertificateRequest {
    certificate_signing_request: String,
    ca: bool,
}

#[derive(Debug, Deserialize)]
struct ProvidedCertificate {
    certificate_signing_request: String,
    certificate: String,
    ca: String,
    #[serde(default)]
    revoked: bool,
}

pub async fn on_relation(
    charm: &Charm<'_>,
    context: &Context<'_>,
    kind: RelationEventKind,
    relation: &Relation,
) -> Result<Outcome> {
    match kind {
        RelationEventKind::Created => {
            if charm.is_leader().await? {
                tracing::info!("enabling TLS");
                context
                    .update_cluster(&[(cluster_keys::TLS, TLS_ENABLED)])
                    .await
                    .context(ModelSnafu)?;
            }
            Ok(Outcome::Done)
        }
        RelationEventKind::Joined => request_certificate(charm, context, None).await,
        RelationEventKind::Changed => on_certificate_available(charm, context, relation).await,
        RelationEventKind::Departed => Ok(Outcome::Done),
        RelationEventKind::Broken => on_broken(charm, context).await,
    }
}

/// Where this unit can be reached, as far as certificates are concerned.
pub async fn unit_addresses(charm: &Charm<'_>, context: &Context<'_>) -> Result<UnitAddresses> {
    let service = charm.service_manager();
    let expose = context.config.expose_external;
    let external = match expose {
        ExposeExternal::False => None,
        _ => service.get_service_endpoint(expose).await,
    };
    let node_ip = match expose {
        ExposeExternal::NodePort => service.node_ip().await,
        _ => None,
    };
    let hostname = charm.model.pod_name();
    Ok(UnitAddresses {
        fqdn: format!(
            "{hostname}.{app}-endpoints.{model}.svc.cluster.local",
            app = charm.model.app_name(),
            model = charm.model.model_name()
        ),
        hostname,
        service_host: service.internal_host(),
        bind_address: charm
            .model
            .bind_address(PEER_REL)
            .await
            .context(ModelSnafu)?,
        node_ip,
        external,
    })
}

/// Builds a signing request for `private_key` from the current addresses and replaces
/// whatever request the unit had published before.
async fn publish_request(
    charm: &Charm<'_>,
    context: &Context<'_>,
    relation: &Relation,
    private_key: &str,
) -> Result<()> {
    let addresses = unit_addresses(charm, context).await?;
    let csr = tls::generate_csr(
        private_key,
        &addresses.subject(context.config.expose_external),
        &addresses.sans(),
    )
    .context(TlsSnafu)?;

    let requests = serde_json::to_string(&[CertificateRequest {
        certificate_signing_request: csr.clone(),
        ca: false,
    }])
    .context(SerializeRelationDataSnafu)?;
    charm
        .model
        .write(
            relation,
            &Bag::LocalUnit,
            &Databag::from([(REQUESTS_KEY.to_string(), requests)]),
        )
        .await
        .context(ModelSnafu)?;
    context
        .update_unit_server(&[(unit_keys::CSR, &csr)])
        .await
        .context(ModelSnafu)?;
    tracing::info!(%relation, "published certificate signing request");
    Ok(())
}

/// Enters CsrPending: picks the key, makes sure the store passwords exist and asks for
/// a certificate. `private_key` overrides every other key source.
pub async fn request_certificate(
    charm: &Charm<'_>,
    context: &Context<'_>,
    private_key: Option<String>,
) -> Result<Outcome> {
    if !context.cluster().await.context(ModelSnafu)?.tls {
        tracing::info!("TLS not enabled by the leader yet, deferring");
        return Ok(Outcome::Defer);
    }
    let Some(relation) = context.relation(TLS_REL).await.context(ModelSnafu)? else {
        tracing::debug!("no certificates relation, nothing to request");
        return Ok(Outcome::Done);
    };

    let server = context.unit_server().await.context(ModelSnafu)?;
    let private_key = match private_key {
        Some(key) => key,
        None => match context.operator_private_key().await.context(ModelSnafu)? {
            Some(key) => key,
            None => match server.private_key {
                Some(key) => key,
                None => tls::generate_private_key().context(TlsSnafu)?,
            },
        },
    };
    let keystore_password = server
        .keystore_password
        .unwrap_or_else(|| generate_password(PASSWORD_LENGTH));
    let truststore_password = server
        .truststore_password
        .unwrap_or_else(|| generate_password(PASSWORD_LENGTH));
    context
        .update_unit_server(&[
            (unit_keys::PRIVATE_KEY, &private_key),
            (unit_keys::KEYSTORE_PASSWORD, &keystore_password),
            (unit_keys::TRUSTSTORE_PASSWORD, &truststore_password),
        ])
        .await
        .context(ModelSnafu)?;

    publish_request(charm, context, &relation, &private_key).await?;
    Ok(Outcome::Done)
}

/// Swaps the outstanding request for a fresh one over the same key.
async fn renew(charm: &Charm<'_>, context: &Context<'_>, reason: &str) -> Result<bool> {
    let Some(relation) = context.relation(TLS_REL).await.context(ModelSnafu)? else {
        return Ok(false);
    };
    let Some(private_key) = context.unit_server().await.context(ModelSnafu)?.private_key else {
        tracing::warn!(reason, "cannot renew the certificate without a private key");
        return Ok(false);
    };
    tracing::info!(reason, "renewing certificate");
    publish_request(charm, context, &relation, &private_key).await?;
    Ok(true)
}

pub async fn renew_if_expiring(charm: &Charm<'_>, context: &Context<'_>) -> Result<bool> {
    let Some(certificate) = context.unit_server().await.context(ModelSnafu)?.certificate else {
        return Ok(false);
    };
    match tls::expires_within(&certificate, EXPIRY_NOTICE_DAYS) {
        Ok(true) => renew(charm, context, "certificate expiring").await,
        Ok(false) => Ok(false),
        Err(error) => {
            tracing::warn!(%error, "unable to read the expiry of the installed certificate");
            Ok(false)
        }
    }
}

/// Requests a new certificate when the unit's addresses no longer match the SANs of
/// the installed one, e.g. after the exposure mode changed.
pub async fn renew_if_sans_changed(charm: &Charm<'_>, context: &Context<'_>) -> Result<bool> {
    if !context.cluster().await.context(ModelSnafu)?.tls {
        return Ok(false);
    }
    if context.unit_server().await.context(ModelSnafu)?.certificate.is_none() {
        return Ok(false);
    }
    let Some(current) = TlsManager::new(charm.workload).current_sans().await else {
        return Ok(false);
    };
    let expected = unit_addresses(charm, context).await?.sans();
    if current == expected {
        return Ok(false);
    }
    tracing::info!(?current, ?expected, "certificate SANs are outdated");
    renew(charm, context, "SANs changed").await
}

async fn provided_certificates(
    charm: &Charm<'_>,
    relation: &Relation,
) -> Result<Vec<ProvidedCertificate>> {
    let data = charm
        .model
        .read(relation, &Bag::RemoteApp)
        .await
        .context(ModelSnafu)?;
    let Some(raw) = data.get(CERTIFICATES_KEY) else {
        return Ok(Vec::new());
    };
    Ok(serde_json::from_str(raw).unwrap_or_else(|error| {
        tracing::warn!(%error, "ignoring malformed certificates from the provider");
        Vec::new()
    }))
}

async fn on_certificate_available(
    charm: &Charm<'_>,
    context: &Context<'_>,
    relation: &Relation,
) -> Result<Outcome> {
    let server = context.unit_server().await.context(ModelSnafu)?;
    let Some(csr) = server.csr.as_deref() else {
        tracing::debug!("no signing request outstanding");
        return Ok(Outcome::Done);
    };
    let Some(provided) = provided_certificates(charm, relation)
        .await?
        .into_iter()
        .find(|provided| provided.certificate_signing_request.trim() == csr.trim())
    else {
        tracing::info!("no certificate issued for the outstanding request yet");
        return Ok(Outcome::Done);
    };
    if provided.revoked {
        tracing::warn!("the certificate for the outstanding request was revoked");
        return Ok(Outcome::Done);
    }
    let certificate = provided.certificate.trim();
    let ca = provided.ca.trim();
    let recorded =
        server.certificate.as_deref() == Some(certificate) && server.ca_cert.as_deref() == Some(ca);
    if recorded
        && charm
            .workload
            .exists(KEYSTORE_PATH)
            .await
            .context(WorkloadSnafu)?
    {
        tracing::debug!("certificate already installed");
        return Ok(Outcome::Done);
    }

    if !charm.workload.ready().await {
        return Ok(Outcome::Defer);
    }
    let (Some(private_key), Some(keystore_password), Some(truststore_password)) = (
        server.private_key.as_deref(),
        server.keystore_password.as_deref(),
        server.truststore_password.as_deref(),
    ) else {
        tracing::warn!("TLS material of the unit is incomplete, ignoring certificate");
        return Ok(Outcome::Done);
    };

    tracing::info!("installing certificate");
    let manager = TlsManager::new(charm.workload);
    manager.set_private_key(private_key).await.context(TlsSnafu)?;
    manager.set_ca(ca).await.context(TlsSnafu)?;
    manager.set_certificate(certificate).await.context(TlsSnafu)?;
    manager
        .set_truststore(truststore_password)
        .await
        .context(TlsSnafu)?;
    manager
        .set_keystore(keystore_password)
        .await
        .context(TlsSnafu)?;
    // recorded only once the stores exist, the rendered config points at the keystore
    context
        .update_unit_server(&[(unit_keys::CERTIFICATE, certificate), (unit_keys::CA_CERT, ca)])
        .await
        .context(ModelSnafu)?;

    charm
        .update(
            context,
            UpdateOptions {
                force_restart: true,
                ..UpdateOptions::default()
            },
        )
        .await?;
    if charm.is_leader().await? {
        provider::update_clients_endpoints(charm, context).await?;
    }
    Ok(Outcome::Done)
}

async fn on_broken(charm: &Charm<'_>, context: &Context<'_>) -> Result<Outcome> {
    if !charm.workload.ready().await {
        return Ok(Outcome::Defer);
    }
    tracing::info!("disabling TLS");
    context
        .update_unit_server(&[
            (unit_keys::CSR, ""),
            (unit_keys::CERTIFICATE, ""),
            (unit_keys::CA_CERT, ""),
        ])
        .await
        .context(ModelSnafu)?;
    TlsManager::new(charm.workload)
        .remove_stores()
        .await
        .context(TlsSnafu)?;

    let leader = charm.is_leader().await?;
    if leader {
        context
            .update_cluster(&[(cluster_keys::TLS, "")])
            .await
            .context(ModelSnafu)?;
    }
    charm
        .update(
            context,
            UpdateOptions {
                set_tls_none: true,
                ..UpdateOptions::default()
            },
        )
        .await?;
    if leader {
        provider::update_clients_endpoints(charm, context).await?;
    }
    Ok(Outcome::Done)
}
