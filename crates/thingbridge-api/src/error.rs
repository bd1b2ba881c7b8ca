use thiserror::Error;

/// Top-level error type for the `thingbridge-api` crate.
///
/// Covers every failure mode across all remote surfaces:
/// hub registry (REST), hub device transport (MQTT), and the thing gateway
/// (REST + WebSocket). `thingbridge-core` maps these into engine errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Credentials rejected (bad SAS token, revoked device key, bad gateway token).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Configuration ───────────────────────────────────────────────
    /// Connection string is missing a required field or is malformed.
    #[error("Invalid connection string: {reason}")]
    InvalidConnectionString { reason: String },

    /// A shared access key is not valid base64.
    #[error("Invalid shared access key: {0}")]
    InvalidKey(String),

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS setup or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Hub registry ────────────────────────────────────────────────
    /// Non-success response from the hub service API.
    #[error("Hub API error (HTTP {status}): {message}")]
    Hub { message: String, status: u16 },

    // ── Hub device transport ────────────────────────────────────────
    /// MQTT client or connection failure not related to credentials.
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// The device connection's event loop has stopped.
    #[error("Device connection closed")]
    ConnectionClosed,

    /// Twin request answered with a non-success status.
    #[error("Twin request failed with status {status}")]
    Twin { status: u16 },

    // ── Thing gateway ───────────────────────────────────────────────
    /// Non-success response from the thing gateway.
    #[error("Gateway error (HTTP {status}): {message}")]
    Gateway { message: String, status: u16 },

    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this error means the presented credential was refused.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Authentication { .. } => true,
            Self::Hub { status, .. } | Self::Gateway { status, .. } => {
                *status == 401 || *status == 403
            }
            Self::Twin { status } => *status == 401 || *status == 403,
            Self::Transport(e) => e
                .status()
                .is_some_and(|s| s == reqwest::StatusCode::UNAUTHORIZED),
            _ => false,
        }
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::WebSocketConnect(_) | Self::ConnectionClosed => true,
            Self::Hub { status, .. } | Self::Gateway { status, .. } => {
                *status == 429 || *status >= 500
            }
            _ => false,
        }
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::Hub { status: 404, .. } | Self::Gateway { status: 404, .. } => true,
            Self::Twin { status: 404 } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_cover_status_codes() {
        assert!(Error::Authentication { message: "x".into() }.is_auth_failure());
        assert!(Error::Hub { message: "x".into(), status: 401 }.is_auth_failure());
        assert!(Error::Twin { status: 403 }.is_auth_failure());
        assert!(!Error::Hub { message: "x".into(), status: 500 }.is_auth_failure());
        assert!(!Error::ConnectionClosed.is_auth_failure());
    }

    #[test]
    fn transient_errors() {
        assert!(Error::Timeout { timeout_secs: 5 }.is_transient());
        assert!(Error::Hub { message: "busy".into(), status: 503 }.is_transient());
        assert!(!Error::Hub { message: "bad".into(), status: 400 }.is_transient());
    }
}
