// Federated identity handshake
//
// Three sequential calls turn a username/password into short-lived cloud
// credentials: user-pool login (bearer token), token → identity id, and
// identity id → credentials. The broker keeps the last successful result
// and answers expiry queries; retry policy belongs to the caller.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, info};
use url::Url;

use crate::auth::{CloudEndpoints, Credentials};
use crate::error::Error;
use crate::transport::TransportConfig;

const AMZ_JSON: &str = "application/x-amz-json-1.1";
const TARGET_INITIATE_AUTH: &str = "AWSCognitoIdentityProviderService.InitiateAuth";
const TARGET_GET_ID: &str = "AWSCognitoIdentityService.GetId";
const TARGET_GET_CREDENTIALS: &str = "AWSCognitoIdentityService.GetCredentialsForIdentity";

// ── Response shapes ─────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateAuthResponse {
    authentication_result: Option<AuthenticationResult>,
    challenge_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticationResult {
    id_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetIdResponse {
    identity_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetCredentialsResponse {
    credentials: Option<RawCredentials>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawCredentials {
    access_key_id: Option<String>,
    secret_key: Option<String>,
    session_token: Option<String>,
    /// Epoch seconds, possibly fractional.
    expiration: Option<f64>,
}

/// Result of a successful [`IdentityBroker::authenticate`] call.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub credentials: Arc<Credentials>,
    pub identity_id: String,
}

// ── IdentityBroker ──────────────────────────────────────────────────

/// Performs the identity handshake and tracks credential expiry.
///
/// Username and password are fixed for the broker's lifetime. The identity
/// id and credentials are replaced wholesale by each successful handshake
/// and only cleared by building a new broker.
pub struct IdentityBroker {
    http: reqwest::Client,
    endpoints: CloudEndpoints,
    username: String,
    password: SecretString,
    identity_id: ArcSwapOption<String>,
    credentials: ArcSwapOption<Credentials>,
}

impl IdentityBroker {
    pub fn new(
        username: String,
        password: SecretString,
        endpoints: CloudEndpoints,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self::with_client(http, username, password, endpoints))
    }

    /// Create a broker around a pre-built `reqwest::Client`.
    pub fn with_client(
        http: reqwest::Client,
        username: String,
        password: SecretString,
        endpoints: CloudEndpoints,
    ) -> Self {
        Self {
            http,
            endpoints,
            username,
            password,
            identity_id: ArcSwapOption::empty(),
            credentials: ArcSwapOption::empty(),
        }
    }

    pub fn endpoints(&self) -> &CloudEndpoints {
        &self.endpoints
    }

    /// Last stored credentials, if any handshake has succeeded.
    pub fn credentials(&self) -> Option<Arc<Credentials>> {
        self.credentials.load_full()
    }

    /// Last stored identity id, if any handshake has succeeded.
    pub fn identity_id(&self) -> Option<String> {
        self.identity_id.load_full().map(|id| id.as_ref().clone())
    }

    /// `true` if no credentials are held or the held ones have expired.
    pub fn is_credentials_expired(&self) -> bool {
        self.credentials
            .load_full()
            .is_none_or(|creds| creds.is_expired())
    }

    /// Run the three-step handshake.
    ///
    /// Each step fails fast; nothing is stored unless all three succeed.
    pub async fn authenticate(&self) -> Result<Handshake, Error> {
        info!(username = %self.username, "starting identity handshake");

        let token = self.login().await?;
        let logins = self.logins(&token);

        let identity_id = self.get_id(&logins).await?;
        let credentials = Arc::new(self.credentials_for_identity(&identity_id, &logins).await?);

        self.identity_id.store(Some(Arc::new(identity_id.clone())));
        self.credentials.store(Some(Arc::clone(&credentials)));

        info!(
            identity_id = %identity_id,
            expires = %credentials.expiration,
            "identity handshake complete"
        );

        Ok(Handshake {
            credentials,
            identity_id,
        })
    }

    // ── Handshake steps ─────────────────────────────────────────────

    async fn login(&self) -> Result<String, Error> {
        let body = json!({
            "AuthFlow": "USER_PASSWORD_AUTH",
            "ClientId": self.endpoints.client_id,
            "AuthParameters": {
                "USERNAME": self.username,
                "PASSWORD": self.password.expose_secret(),
            },
        });

        let resp: InitiateAuthResponse = self
            .call(&self.endpoints.idp_url, TARGET_INITIATE_AUTH, &body, "login")
            .await?;

        if let Some(token) = resp.authentication_result.and_then(|r| r.id_token) {
            debug!("login step succeeded");
            return Ok(token);
        }

        let message = match resp.challenge_name {
            Some(challenge) => format!("login: unsupported challenge {challenge}"),
            None => "login: response missing AuthenticationResult.IdToken".into(),
        };
        Err(Error::Authentication { message })
    }

    async fn get_id(&self, logins: &Map<String, Value>) -> Result<String, Error> {
        let body = json!({
            "IdentityPoolId": self.endpoints.identity_pool_id,
            "Logins": logins,
        });

        let resp: GetIdResponse = self
            .call(&self.endpoints.identity_url, TARGET_GET_ID, &body, "identity lookup")
            .await?;

        let identity_id = resp.identity_id.ok_or_else(|| Error::Authentication {
            message: "identity lookup: response missing IdentityId".into(),
        })?;
        debug!(identity_id = %identity_id, "identity lookup succeeded");
        Ok(identity_id)
    }

    async fn credentials_for_identity(
        &self,
        identity_id: &str,
        logins: &Map<String, Value>,
    ) -> Result<Credentials, Error> {
        let body = json!({
            "IdentityId": identity_id,
            "Logins": logins,
        });

        let resp: GetCredentialsResponse = self
            .call(
                &self.endpoints.identity_url,
                TARGET_GET_CREDENTIALS,
                &body,
                "credential exchange",
            )
            .await?;

        let missing = |field: &str| Error::Authentication {
            message: format!("credential exchange: response missing Credentials.{field}"),
        };

        let raw = resp.credentials.ok_or_else(|| missing("*"))?;
        let access_key_id = raw.access_key_id.ok_or_else(|| missing("AccessKeyId"))?;
        let secret_key = raw.secret_key.ok_or_else(|| missing("SecretKey"))?;
        let expiration = raw
            .expiration
            .and_then(expiration_from_epoch)
            .ok_or_else(|| missing("Expiration"))?;

        Ok(Credentials {
            access_key_id,
            secret_access_key: SecretString::from(secret_key),
            session_token: raw.session_token.map(SecretString::from),
            expiration,
        })
    }

    // ── Shared call mechanics ───────────────────────────────────────

    fn logins(&self, token: &str) -> Map<String, Value> {
        let mut logins = Map::new();
        logins.insert(self.endpoints.login_provider(), Value::String(token.to_owned()));
        logins
    }

    /// POST one JSON-RPC style call and decode the response.
    ///
    /// Transport failures, non-success statuses and undecodable bodies all
    /// become [`Error::Authentication`]; the upstream body is kept verbatim.
    async fn call<T: DeserializeOwned>(
        &self,
        url: &Url,
        target: &str,
        body: &Value,
        step: &str,
    ) -> Result<T, Error> {
        debug!(step, %url, "identity request");

        let resp = self
            .http
            .post(url.clone())
            .header(CONTENT_TYPE, AMZ_JSON)
            .header("X-Amz-Target", target)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| Error::Authentication {
                message: format!("{step}: request failed: {e}"),
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| Error::Authentication {
            message: format!("{step}: failed to read response: {e}"),
        })?;

        if !status.is_success() {
            return Err(Error::Authentication {
                message: format!("{step} failed (HTTP {status}): {text}"),
            });
        }

        serde_json::from_str(&text).map_err(|e| Error::Authentication {
            message: format!("{step}: malformed response ({e}): {text}"),
        })
    }
}

fn expiration_from_epoch(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let millis = (secs * 1000.0).round() as i64;
    DateTime::from_timestamp_millis(millis)
}
