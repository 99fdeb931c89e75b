//! Signature V4 headers for the broker's WebSocket upgrade.
//!
//! [`sign`] is a pure function of (credentials, host, scope, timestamp):
//! identical inputs always produce identical headers, so callers must pass
//! a fresh timestamp for every connection attempt. A stale one is refused
//! by the broker.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};

use crate::auth::{Credentials, SigningScope};
use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const HANDSHAKE_METHOD: &str = "GET";
const HANDSHAKE_PATH: &str = "/mqtt";
const SIGNED_HEADERS: &str = "host;x-amz-date";

pub const HOST_HEADER: &str = "host";
pub const DATE_HEADER: &str = "x-amz-date";
pub const AUTHORIZATION_HEADER: &str = "authorization";
pub const SECURITY_TOKEN_HEADER: &str = "x-amz-security-token";

/// Header set authenticating one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub host: String,
    pub amz_date: String,
    pub authorization: String,
    pub security_token: Option<String>,
}

impl SignedHeaders {
    /// `(name, value)` pairs in wire order, session token last when present.
    pub fn pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = vec![
            (HOST_HEADER, self.host.as_str()),
            (DATE_HEADER, self.amz_date.as_str()),
            (AUTHORIZATION_HEADER, self.authorization.as_str()),
        ];
        if let Some(token) = &self.security_token {
            pairs.push((SECURITY_TOKEN_HEADER, token.as_str()));
        }
        pairs
    }
}

/// Compute the signed header set for the `GET /mqtt` upgrade request.
pub fn sign(
    credentials: &Credentials,
    host: &str,
    scope: &SigningScope,
    timestamp: DateTime<Utc>,
) -> Result<SignedHeaders, Error> {
    let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();
    let date = timestamp.format("%Y%m%d").to_string();
    let credential_scope = format!("{date}/{}/{}/aws4_request", scope.region, scope.service);

    let request = canonical_request(host, &amz_date);
    let to_sign = string_to_sign(&amz_date, &credential_scope, &request);

    let key = signing_key(
        credentials.secret_access_key.expose_secret(),
        &date,
        &scope.region,
        &scope.service,
    )?;
    let signature = hex::encode(hmac(&key, to_sign.as_bytes())?);

    let authorization = format!(
        "{ALGORITHM} Credential={}/{credential_scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
        credentials.access_key_id
    );

    Ok(SignedHeaders {
        host: host.to_owned(),
        amz_date,
        authorization,
        security_token: credentials
            .session_token
            .as_ref()
            .map(|token| token.expose_secret().to_owned()),
    })
}

fn canonical_request(host: &str, amz_date: &str) -> String {
    let payload_hash = hex::encode(Sha256::digest(b""));
    format!(
        "{HANDSHAKE_METHOD}\n{HANDSHAKE_PATH}\n\nhost:{host}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{payload_hash}"
    )
}

fn string_to_sign(amz_date: &str, credential_scope: &str, canonical_request: &str) -> String {
    let request_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("{ALGORITHM}\n{amz_date}\n{credential_scope}\n{request_hash}")
}

/// Four-step keyed-hash chain: secret → date → region → service → request.
fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>, Error> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| Error::InvalidInput {
        field: "signing key",
        reason: e.to_string(),
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
