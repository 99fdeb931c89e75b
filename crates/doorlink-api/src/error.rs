use thiserror::Error;

/// Top-level error type for the `doorlink-api` crate.
///
/// Covers every wire-level failure mode: the identity handshake, HTTP
/// transport, the WebSocket upgrade, and the MQTT session riding on it.
/// `doorlink-core` maps these into user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// A handshake step was rejected, malformed, or never reached the
    /// upstream. The message carries the upstream body verbatim when one
    /// was returned.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// The caller supplied an unusable input (empty username, etc.).
    #[error("Invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    // ── Transport ───────────────────────────────────────────────────
    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── WebSocket ───────────────────────────────────────────────────
    /// The WebSocket upgrade could not be completed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// Read or write failure on an established socket.
    #[error("Broker link failed: {0}")]
    LinkFailed(String),

    /// The broker answered the upgrade with an HTTP error status.
    /// 401/403 mean the signature or credentials were refused.
    #[error("WebSocket upgrade rejected (HTTP {status})")]
    WebSocketRejected { status: u16 },

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    // ── MQTT ────────────────────────────────────────────────────────
    /// Malformed packet, unexpected packet, or a broker refusal code.
    #[error("MQTT protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Returns `true` if this error indicates the credentials were refused
    /// and a fresh handshake might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        match self {
            Self::Authentication { .. } => true,
            Self::WebSocketRejected { status } => matches!(status, 401 | 403),
            _ => false,
        }
    }
}
