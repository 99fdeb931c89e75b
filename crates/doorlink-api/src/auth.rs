use chrono::{DateTime, Utc};
use secrecy::SecretString;
use url::Url;

use crate::error::Error;

/// Signing service name for the broker's WebSocket endpoint.
pub const BROKER_SERVICE: &str = "iotdevicegateway";

/// Short-lived cloud credentials produced by one identity handshake.
///
/// Immutable: a newer handshake replaces the whole value, it is never
/// patched in place.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    pub session_token: Option<SecretString>,
    pub expiration: DateTime<Utc>,
}

impl Credentials {
    /// `true` once the wall clock has reached the expiration instant.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }
}

/// The (region, service) pair a signature is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningScope {
    pub region: String,
    pub service: String,
}

impl SigningScope {
    pub fn broker(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: BROKER_SERVICE.into(),
        }
    }
}

/// Everything needed to reach the identity provider and the broker for
/// one deployment region.
///
/// The URL fields default to the public regional endpoints and can be
/// pointed elsewhere (a local mock server in tests). The login provider
/// key used in the token exchange is always derived from the region and
/// user pool, never from the overridden URL.
#[derive(Debug, Clone)]
pub struct CloudEndpoints {
    pub region: String,
    pub user_pool_id: String,
    pub client_id: String,
    pub identity_pool_id: String,
    pub idp_url: Url,
    pub identity_url: Url,
    pub broker_host: String,
    pub broker_url: Url,
}

impl CloudEndpoints {
    pub fn for_region(
        region: &str,
        user_pool_id: &str,
        client_id: &str,
        identity_pool_id: &str,
        broker_host: &str,
    ) -> Result<Self, Error> {
        if region.trim().is_empty() {
            return Err(Error::InvalidInput {
                field: "region",
                reason: "must not be empty".into(),
            });
        }

        Ok(Self {
            region: region.to_owned(),
            user_pool_id: user_pool_id.to_owned(),
            client_id: client_id.to_owned(),
            identity_pool_id: identity_pool_id.to_owned(),
            idp_url: Url::parse(&format!("https://cognito-idp.{region}.amazonaws.com/"))?,
            identity_url: Url::parse(&format!("https://cognito-identity.{region}.amazonaws.com/"))?,
            broker_host: broker_host.to_owned(),
            broker_url: Url::parse(&format!("wss://{broker_host}/mqtt"))?,
        })
    }

    /// Key of the `Logins` map: `{provider-host}/{user-pool-id}`.
    pub fn login_provider(&self) -> String {
        format!(
            "cognito-idp.{}.amazonaws.com/{}",
            self.region, self.user_pool_id
        )
    }

    pub fn signing_scope(&self) -> SigningScope {
        SigningScope::broker(self.region.clone())
    }

    pub fn with_idp_url(mut self, url: Url) -> Self {
        self.idp_url = url;
        self
    }

    pub fn with_identity_url(mut self, url: Url) -> Self {
        self.identity_url = url;
        self
    }

    pub fn with_broker_url(mut self, url: Url) -> Self {
        self.broker_url = url;
        self
    }
}
