// ── Core error types ──
//
// User-facing errors from doorlink-core. Consumers never match on HTTP
// bodies or MQTT return codes directly; the `From<doorlink_api::Error>`
// impl folds wire-level failures into these variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Cannot connect to broker: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Broker did not acknowledge within {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    // ── Device errors ────────────────────────────────────────────────
    #[error("Device did not report status within {timeout_ms}ms")]
    StatusTimeout { timeout_ms: u64 },

    #[error("Invalid status payload: {message}")]
    InvalidStatus { message: String },

    #[error("MQTT protocol error: {message}")]
    Protocol { message: String },

    // ── Input errors ─────────────────────────────────────────────────
    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<doorlink_api::Error> for CoreError {
    fn from(err: doorlink_api::Error) -> Self {
        match err {
            doorlink_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            doorlink_api::Error::InvalidInput { field, reason } => CoreError::ValidationFailed {
                message: format!("{field} {reason}"),
            },
            doorlink_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            doorlink_api::Error::Tls(msg) => CoreError::ConnectionFailed {
                reason: format!("TLS error: {msg}"),
            },
            doorlink_api::Error::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                reason: format!("WebSocket connection failed: {reason}"),
            },
            doorlink_api::Error::LinkFailed(reason) => CoreError::ConnectionFailed {
                reason: format!("broker link failed: {reason}"),
            },
            doorlink_api::Error::WebSocketRejected { status } => match status {
                401 | 403 => CoreError::AuthenticationFailed {
                    message: format!("broker refused signed upgrade (HTTP {status})"),
                },
                _ => CoreError::ConnectionFailed {
                    reason: format!("WebSocket upgrade rejected (HTTP {status})"),
                },
            },
            doorlink_api::Error::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            doorlink_api::Error::Protocol(message) => CoreError::Protocol { message },
        }
    }
}
