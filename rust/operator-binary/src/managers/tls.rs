//! TLS material of a unit: private keys, signing requests and the Java stores Kyuubi
//! serves its frontend from.

use std::{
    cmp::Ordering,
    collections::BTreeSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use openssl::{
    asn1::Asn1Time,
    base64,
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{Id, PKey},
    rsa::Rsa,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req, X509ReqBuilder, X509},
};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::{
    charm::{
        CA_PATH, CERTIFICATE_PATH, ExposeExternal, KEYSTORE_PATH, SERVER_KEY_PATH,
        TRUSTSTORE_CA_ALIAS, TRUSTSTORE_OLD_CA_ALIAS, TRUSTSTORE_PATH,
    },
    command,
    managers::service::Endpoint,
    workload::{self, Workload},
};

pub const MIN_KEY_BITS: u32 = 2048;
pub const EXPIRY_NOTICE_DAYS: u32 = 7;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to generate a private key"))]
    GenerateKey { source: ErrorStack },

    #[snafu(display("private key is neither PEM nor base64 encoded PEM"))]
    DecodePrivateKey,

    #[snafu(display("failed to parse private key"))]
    ParsePrivateKey { source: ErrorStack },

    #[snafu(display("private key is not an RSA key"))]
    NotRsa,

    #[snafu(display("RSA key has {bits} bits, at least {MIN_KEY_BITS} are required"))]
    KeyTooSmall { bits: u32 },

    #[snafu(display("failed to build the certificate signing request"))]
    BuildCsr { source: ErrorStack },

    #[snafu(display("failed to parse certificate"))]
    ParseCertificate { source: ErrorStack },

    #[snafu(display("failed to {step}"))]
    Workload {
        source: workload::Error,
        step: &'static str,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Subject alternative names, sorted and de-duplicated.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Sans {
    pub ip: Vec<String>,
    pub dns: Vec<String>,
}

impl Sans {
    pub fn new(
        ip: impl IntoIterator<Item = String>,
        dns: impl IntoIterator<Item = String>,
    ) -> Self {
        let sorted = |values: Box<dyn Iterator<Item = String> + '_>| {
            values
                .filter(|value| !value.is_empty())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };
        Self {
            ip: sorted(Box::new(ip.into_iter())),
            dns: sorted(Box::new(dns.into_iter())),
        }
    }
}

/// Names and addresses a unit is reachable under.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnitAddresses {
    /// Pod name, e.g. `kyuubi-k8s-0`.
    pub hostname: String,
    pub fqdn: String,
    /// Cluster internal DNS name of the exposing service.
    pub service_host: String,
    pub bind_address: Option<String>,
    /// Only known when exposed through a NodePort.
    pub node_ip: Option<String>,
    pub external: Option<Endpoint>,
}

impl UnitAddresses {
    /// Common name of the certificate: the address clients outside the cluster use.
    pub fn subject(&self, expose: ExposeExternal) -> String {
        match (expose, &self.external, &self.node_ip) {
            (ExposeExternal::LoadBalancer, Some(external), _) => external.host.clone(),
            (ExposeExternal::NodePort, _, Some(node_ip)) => node_ip.clone(),
            _ => self.hostname.clone(),
        }
    }

    pub fn sans(&self) -> Sans {
        let mut ip = vec![];
        ip.extend(self.bind_address.clone());
        ip.extend(self.node_ip.clone());
        let mut dns = vec![
            self.hostname.clone(),
            self.fqdn.clone(),
            self.service_host.clone(),
        ];
        match &self.external {
            Some(external) if external.is_ip() => ip.push(external.host.clone()),
            Some(external) => dns.push(external.host.clone()),
            None => {}
        }
        Sans::new(ip, dns)
    }
}

/// A fresh RSA 2048 key as PKCS#8 PEM.
pub fn generate_private_key() -> Result<String> {
    let rsa = Rsa::generate(MIN_KEY_BITS).context(GenerateKeySnafu)?;
    let key = PKey::from_rsa(rsa).context(GenerateKeySnafu)?;
    let pem = key.private_key_to_pem_pkcs8().context(GenerateKeySnafu)?;
    String::from_utf8(pem).ok().context(DecodePrivateKeySnafu)
}

/// Accepts PEM text or base64 encoded PEM text and returns the PEM once it is known to
/// hold an RSA key of at least [`MIN_KEY_BITS`] bits.
pub fn parse_private_key(input: &str) -> Result<String> {
    let input = input.trim();
    let pem = if input.contains("-----BEGIN") {
        input.to_string()
    } else {
        let compact = input.split_whitespace().collect::<String>();
        let decoded = base64::decode_block(&compact)
            .ok()
            .context(DecodePrivateKeySnafu)?;
        String::from_utf8(decoded)
            .ok()
            .context(DecodePrivateKeySnafu)?
            .trim()
            .to_string()
    };

    let key = PKey::private_key_from_pem(pem.as_bytes()).context(ParsePrivateKeySnafu)?;
    ensure!(key.id() == Id::RSA, NotRsaSnafu);
    let bits = key.bits();
    ensure!(bits >= MIN_KEY_BITS, KeyTooSmallSnafu { bits });
    Ok(pem)
}

pub fn generate_csr(private_key: &str, subject: &str, sans: &Sans) -> Result<String> {
    let key = PKey::private_key_from_pem(private_key.as_bytes()).context(ParsePrivateKeySnafu)?;

    let mut name = X509NameBuilder::new().context(BuildCsrSnafu)?;
    name.append_entry_by_nid(Nid::COMMONNAME, subject)
        .context(BuildCsrSnafu)?;
    let name = name.build();

    let mut builder = X509ReqBuilder::new().context(BuildCsrSnafu)?;
    builder.set_subject_name(&name).context(BuildCsrSnafu)?;
    builder.set_pubkey(&key).context(BuildCsrSnafu)?;

    if !sans.ip.is_empty() || !sans.dns.is_empty() {
        let mut alt_names = SubjectAlternativeName::new();
        for dns in &sans.dns {
            alt_names.dns(dns);
        }
        for ip in &sans.ip {
            alt_names.ip(ip);
        }
        let extension = alt_names
            .build(&builder.x509v3_context(None))
            .context(BuildCsrSnafu)?;
        let mut extensions = Stack::new().context(BuildCsrSnafu)?;
        extensions.push(extension).context(BuildCsrSnafu)?;
        builder.add_extensions(&extensions).context(BuildCsrSnafu)?;
    }

    builder
        .sign(&key, MessageDigest::sha256())
        .context(BuildCsrSnafu)?;
    let pem = builder.build().to_pem().context(BuildCsrSnafu)?;
    Ok(String::from_utf8_lossy(&pem).trim().to_string())
}

/// Whether `csr` was derived from `private_key`.
pub fn csr_matches_key(csr: &str, private_key: &str) -> bool {
    let (Ok(request), Ok(key)) = (
        X509Req::from_pem(csr.as_bytes()),
        PKey::private_key_from_pem(private_key.as_bytes()),
    ) else {
        return false;
    };
    request
        .public_key()
        .map(|public| public.public_eq(&key))
        .unwrap_or(false)
}

fn ip_to_string(bytes: &[u8]) -> Option<String> {
    let ip = match bytes.len() {
        4 => IpAddr::V4(Ipv4Addr::from(<[u8; 4]>::try_from(bytes).ok()?)),
        16 => IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(bytes).ok()?)),
        _ => return None,
    };
    Some(ip.to_string())
}

/// SANs of a PEM certificate.
pub fn certificate_sans(certificate: &str) -> Result<Sans> {
    let certificate = X509::from_pem(certificate.as_bytes()).context(ParseCertificateSnafu)?;
    let names = certificate.subject_alt_names();
    let names = names.iter().flatten();
    let (mut ip, mut dns) = (Vec::new(), Vec::new());
    for name in names {
        if let Some(name) = name.dnsname() {
            dns.push(name.to_string());
        }
        if let Some(address) = name.ipaddress().and_then(ip_to_string) {
            ip.push(address);
        }
    }
    Ok(Sans::new(ip, dns))
}

/// Whether the certificate expires within `days`.
pub fn expires_within(certificate: &str, days: u32) -> Result<bool> {
    let certificate = X509::from_pem(certificate.as_bytes()).context(ParseCertificateSnafu)?;
    let limit = Asn1Time::days_from_now(days).context(ParseCertificateSnafu)?;
    let ordering = certificate
        .not_after()
        .compare(&limit)
        .context(ParseCertificateSnafu)?;
    Ok(ordering == Ordering::Less)
}

/// Puts the unit's TLS material into the workload.
pub struct TlsManager<'a> {
    workload: &'a dyn Workload,
}

impl<'a> TlsManager<'a> {
    pub fn new(workload: &'a dyn Workload) -> Self {
        Self { workload }
    }

    async fn write(&self, path: &str, content: &str, step: &'static str) -> Result<()> {
        self.workload
            .write(path, content)
            .await
            .context(WorkloadSnafu { step })
    }

    pub async fn set_private_key(&self, private_key: &str) -> Result<()> {
        self.write(SERVER_KEY_PATH, private_key, "write the private key")
            .await
    }

    pub async fn set_ca(&self, ca: &str) -> Result<()> {
        self.write(CA_PATH, ca, "write the CA").await
    }

    pub async fn set_certificate(&self, certificate: &str) -> Result<()> {
        self.write(CERTIFICATE_PATH, certificate, "write the certificate")
            .await
    }

    /// Imports the CA into the truststore. A CA that is already present is replaced in
    /// three steps so that the store never runs empty: Kyuubi watches the file and
    /// crashes if it observes a truststore without entries.
    /// Drops an `old-ca` alias left behind by an interrupted replacement.
    async fn remove_stale_ca(&self, password: &str) -> Result<()> {
        let delete =
            command::delete_truststore_alias(TRUSTSTORE_OLD_CA_ALIAS, TRUSTSTORE_PATH, password);
        match self.workload.exec(&delete).await {
            Ok(_) => {
                tracing::info!("removed a stale CA from the truststore");
                Ok(())
            }
            Err(error) if error.output().contains("does not exist") => Ok(()),
            Err(source) => Err(source).context(WorkloadSnafu {
                step: "delete a stale CA",
            }),
        }
    }

    pub async fn set_truststore(&self, password: &str) -> Result<()> {
        let import =
            command::import_truststore_ca(TRUSTSTORE_CA_ALIAS, CA_PATH, TRUSTSTORE_PATH, password);
        match self.workload.exec(&import).await {
            Ok(_) => return self.remove_stale_ca(password).await,
            Err(error) if error.output().contains("already exists") => {
                tracing::info!("replacing the CA in the truststore");
            }
            Err(source) => {
                return Err(source).context(WorkloadSnafu {
                    step: "import the CA into the truststore",
                })
            }
        }

        self.remove_stale_ca(password).await?;
        self.workload
            .exec(&command::rename_truststore_alias(
                TRUSTSTORE_CA_ALIAS,
                TRUSTSTORE_OLD_CA_ALIAS,
                TRUSTSTORE_PATH,
                password,
            ))
            .await
            .context(WorkloadSnafu {
                step: "rename the previous CA",
            })?;
        self.workload
            .exec(&import)
            .await
            .context(WorkloadSnafu {
                step: "import the new CA",
            })?;
        self.workload
            .exec(&command::delete_truststore_alias(
                TRUSTSTORE_OLD_CA_ALIAS,
                TRUSTSTORE_PATH,
                password,
            ))
            .await
            .context(WorkloadSnafu {
                step: "delete the previous CA",
            })?;
        Ok(())
    }

    pub async fn set_keystore(&self, password: &str) -> Result<()> {
        self.workload
            .exec(&command::export_pkcs12_keystore(
                CERTIFICATE_PATH,
                SERVER_KEY_PATH,
                KEYSTORE_PATH,
                password,
            ))
            .await
            .context(WorkloadSnafu {
                step: "build the keystore",
            })?;
        Ok(())
    }

    pub async fn remove_stores(&self) -> Result<()> {
        self.workload
            .exec(&command::remove_files(&[
                CA_PATH,
                CERTIFICATE_PATH,
                KEYSTORE_PATH,
                TRUSTSTORE_PATH,
            ]))
            .await
            .context(WorkloadSnafu {
                step: "remove the TLS stores",
            })?;
        Ok(())
    }

    /// SANs of the installed certificate, if any.
    pub async fn current_sans(&self) -> Option<Sans> {
        let certificate = self.workload.read(CERTIFICATE_PATH).await.ok()??;
        match certificate_sans(&certificate) {
            Ok(sans) => Some(sans),
            Err(error) => {
                tracing::warn!(%error, "unable to read SANs of the installed certificate");
                None
            }
        }
    }
}
