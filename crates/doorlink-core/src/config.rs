// ── Runtime device configuration ──
//
// These types describe *which* device to talk to and *how* patiently.
// They carry credential data and connection tuning, but never touch disk.
// doorlink-config (or the embedding application) builds a `DeviceConfig`
// and hands it in.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use doorlink_api::{CloudEndpoints, TransportConfig};

use crate::error::CoreError;

/// Timeouts and retry limits for one device connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTuning {
    /// Upper bound on the upgrade + CONNACK exchange, and separately on
    /// the SUBACK that follows it.
    pub connect_timeout: Duration,
    /// How long a status query waits for the device to answer.
    pub status_timeout: Duration,
    /// Consecutive reconnect attempts before the manager gives up.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub reconnect_base_delay: Duration,
    /// MQTT keep-alive and PINGREQ interval.
    pub keepalive_interval: Duration,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            status_timeout: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Everything needed to control one garage door.
///
/// Built by the caller, passed to [`GarageDoor::new`](crate::GarageDoor::new).
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub username: String,
    pub password: SecretString,
    /// Device identifier; also the topic prefix (`{device_id}/rsp`, `{device_id}/cmd`).
    pub device_id: String,
    pub endpoints: CloudEndpoints,
    pub tuning: ConnectionTuning,
    /// HTTP settings for the identity handshake.
    pub transport: TransportConfig,
}

impl DeviceConfig {
    /// Validate and assemble a configuration with default tuning.
    ///
    /// Username, password and device id must each contain something other
    /// than whitespace.
    pub fn new(
        username: impl Into<String>,
        password: SecretString,
        device_id: impl Into<String>,
        endpoints: CloudEndpoints,
    ) -> Result<Self, CoreError> {
        let username = username.into();
        let device_id = device_id.into();

        require("username", &username)?;
        require("password", password.expose_secret())?;
        require("device_id", &device_id)?;

        Ok(Self {
            username,
            password,
            device_id,
            endpoints,
            tuning: ConnectionTuning::default(),
            transport: TransportConfig::default(),
        })
    }

    pub fn with_tuning(mut self, tuning: ConnectionTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }
}

fn require(field: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::ValidationFailed {
            message: format!("{field} must not be empty"),
        });
    }
    Ok(())
}
