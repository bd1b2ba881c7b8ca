// ── Core error types ──
//
// Errors surfaced by the engine. Consumers never see MQTT return codes
// or HTTP bodies directly: the `From<thingbridge_api::Error>` impl
// translates transport-layer errors into domain-appropriate variants.

use thiserror::Error;

/// Unified error type for the core crate.
///
/// `Clone` so a single connection failure can be reported for both the
/// telemetry and the twin half of a flush.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Identity errors ──────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Could not provision device {device_id}: {reason}")]
    ProvisioningFailed { device_id: String, reason: String },

    // ── Transport errors ─────────────────────────────────────────────
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Device session closed")]
    SessionClosed,

    #[error("Operation timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Collaborator errors ──────────────────────────────────────────
    #[error("Identity registry error: {message}")]
    Registry {
        message: String,
        /// HTTP status code (if applicable).
        status: Option<u16>,
    },

    #[error("Credential store error: {message}")]
    CredentialStore { message: String },

    #[error("Thing source error: {message}")]
    ThingSource { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// The hub rejected the device credential.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }

    /// The cached device session can no longer be used and must be
    /// rebuilt on the next flush.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed { .. } | Self::SessionClosed
        )
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<thingbridge_api::Error> for CoreError {
    fn from(err: thingbridge_api::Error) -> Self {
        use thingbridge_api::Error as Api;

        match err {
            Api::Authentication { message } => CoreError::AuthenticationFailed { message },
            Api::InvalidKey(reason) => CoreError::AuthenticationFailed {
                message: format!("device key cannot sign tokens: {reason}"),
            },
            Api::InvalidConnectionString { reason } => CoreError::Config {
                message: format!("Invalid hub connection string: {reason}"),
            },
            Api::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            Api::Transport(ref e) if e.is_timeout() => CoreError::Timeout { timeout_secs: 0 },
            Api::Transport(e) => CoreError::Transport {
                message: e.to_string(),
            },
            Api::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            Api::Tls(msg) => CoreError::Transport {
                message: format!("TLS error: {msg}"),
            },
            Api::Mqtt(msg) => CoreError::Transport { message: msg },
            Api::ConnectionClosed => CoreError::SessionClosed,
            Api::Twin { status: status @ (401 | 403) } => CoreError::AuthenticationFailed {
                message: format!("twin request rejected (status {status})"),
            },
            Api::Twin { status } => CoreError::Transport {
                message: format!("twin request failed with status {status}"),
            },
            Api::Hub { message, status } => CoreError::Registry {
                message,
                status: Some(status),
            },
            Api::Gateway { message, status } => CoreError::ThingSource {
                message: format!("gateway returned {status}: {message}"),
            },
            Api::WebSocketConnect(reason) => CoreError::ThingSource {
                message: format!("WebSocket connection failed: {reason}"),
            },
            Api::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
        }
    }
}
