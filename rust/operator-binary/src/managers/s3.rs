//! Checks that the S3 credentials handed over by the object storage integrator work.
//!
//! A signed `ListBuckets` call is the cheapest request that every S3 implementation
//! answers and that fails on wrong keys.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use openssl::{
    error::ErrorStack,
    hash::MessageDigest,
    pkey::PKey,
    sha::sha256,
    sign::Signer,
};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::domain::S3ConnectionInfo;

pub const DEFAULT_ENDPOINT: &str = "https://s3.amazonaws.com";
pub const DEFAULT_REGION: &str = "us-east-1";

const SERVICE: &str = "s3";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("invalid S3 endpoint {endpoint:?}"))]
    InvalidEndpoint { endpoint: String },

    #[snafu(display("failed to sign the S3 request"))]
    Sign { source: ErrorStack },

    #[snafu(display("invalid CA certificate in tls-ca-chain"))]
    AddCaCertificate { source: reqwest::Error },

    #[snafu(display("failed to build the HTTP client"))]
    BuildClient { source: reqwest::Error },

    #[snafu(display("request to {endpoint} failed"))]
    Request {
        source: reqwest::Error,
        endpoint: String,
    },

    #[snafu(display("{endpoint} rejected the credentials with HTTP {status}"))]
    Rejected { endpoint: String, status: u16 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[async_trait]
pub trait ObjectStorageVerifier: Send + Sync {
    /// Whether the bucket backend accepts the credentials. Never fails.
    async fn verify(&self, s3: &S3ConnectionInfo) -> bool;
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>, ErrorStack> {
    let key = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
    signer.update(data.as_bytes())?;
    signer.sign_to_vec()
}

/// AWS Signature Version 4 signing key for one day, region and service.
fn signing_key(
    secret_key: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, ErrorStack> {
    let date_key = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date)?;
    let region_key = hmac_sha256(&date_key, region)?;
    let service_key = hmac_sha256(&region_key, service)?;
    hmac_sha256(&service_key, "aws4_request")
}

/// Headers of a SigV4 signed `GET /` against `host`.
fn signed_headers(
    s3: &S3ConnectionInfo,
    host: &str,
    now: DateTime<Utc>,
) -> Result<Vec<(&'static str, String)>, ErrorStack> {
    let region = s3.region.as_deref().unwrap_or(DEFAULT_REGION);
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let payload_hash = hex(&sha256(b""));

    let canonical_request = format!(
        "GET\n/\n\nhost:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{payload_hash}"
    );
    let scope = format!("{date}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{hash}",
        hash = hex(&sha256(canonical_request.as_bytes()))
    );
    let signature = hex(&hmac_sha256(
        &signing_key(&s3.secret_key, &date, region, SERVICE)?,
        &string_to_sign,
    )?);

    Ok(vec![
        (
            "authorization",
            format!(
                "AWS4-HMAC-SHA256 Credential={access_key}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
                access_key = s3.access_key
            ),
        ),
        ("x-amz-content-sha256", payload_hash),
        ("x-amz-date", amz_date),
    ])
}

pub struct S3Manager;

impl S3Manager {
    async fn list_buckets(s3: &S3ConnectionInfo) -> Result<()> {
        let endpoint = s3.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        let url = reqwest::Url::parse(endpoint)
            .ok()
            .and_then(|url| url.join("/").ok())
            .context(InvalidEndpointSnafu { endpoint })?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return InvalidEndpointSnafu { endpoint }.fail(),
        };

        let mut client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        for pem in &s3.tls_ca_chain {
            let certificate =
                reqwest::Certificate::from_pem(pem.as_bytes()).context(AddCaCertificateSnafu)?;
            client = client.add_root_certificate(certificate);
        }
        let client = client.build().context(BuildClientSnafu)?;

        let mut request = client.get(url);
        for (name, value) in signed_headers(s3, &host, Utc::now()).context(SignSnafu)? {
            request = request.header(name, value);
        }
        let response = request.send().await.context(RequestSnafu { endpoint })?;

        let status = response.status();
        ensure!(
            status.is_success(),
            RejectedSnafu {
                endpoint,
                status: status.as_u16()
            }
        );
        Ok(())
    }
}

#[async_trait]
impl ObjectStorageVerifier for S3Manager {
    async fn verify(&self, s3: &S3ConnectionInfo) -> bool {
        match Self::list_buckets(s3).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(%error, bucket = %s3.bucket, "S3 credentials could not be verified");
                false
            }
        }
    }
}
