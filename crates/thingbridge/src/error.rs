//! CLI error types with miette diagnostics.
//!
//! Maps `ConfigError` and `CoreError` variants into user-facing errors
//! with actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use thingbridge_config::ConfigError;
use thingbridge_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("No {field} configured")]
    #[diagnostic(
        code(thingbridge::missing_secret),
        help(
            "Set it in the config file, name an environment variable for it,\n\
             or store it with: thingbridge config set-secret <NAME>"
        )
    )]
    MissingSecret { field: String },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(thingbridge::validation))]
    Validation { field: String, reason: String },

    #[error("Could not load configuration from {path}")]
    #[diagnostic(
        code(thingbridge::config),
        help("Check the file for TOML syntax errors. Run: thingbridge config path")
    )]
    Config {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error("Keyring error: {message}")]
    #[diagnostic(code(thingbridge::keyring))]
    Keyring { message: String },

    // ── Hub and gateway ──────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(thingbridge::auth_failed),
        help(
            "Verify the hub connection string grants registry read/write,\n\
             and that the gateway access token is still valid."
        )
    )]
    AuthFailed { message: String },

    #[error("Could not reach {what}: {message}")]
    #[diagnostic(
        code(thingbridge::connection_failed),
        help("Check that the service is running and reachable. Use --insecure (-k) for self-signed gateways.")
    )]
    ConnectionFailed { what: String, message: String },

    #[error("Timed out after {seconds}s")]
    #[diagnostic(code(thingbridge::timeout), help("Increase --timeout or the `timeout` config key."))]
    Timeout { seconds: u64 },

    #[error("{message}")]
    #[diagnostic(code(thingbridge::bridge))]
    Bridge { message: String },

    // ── Local ────────────────────────────────────────────────────────
    #[error("Failed to render output: {0}")]
    #[diagnostic(code(thingbridge::output))]
    Render(String),

    #[error(transparent)]
    #[diagnostic(code(thingbridge::io))]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingSecret { .. } | Self::AuthFailed { .. } | Self::Keyring { .. } => {
                exit_code::AUTH
            }
            Self::Validation { .. } | Self::Config { .. } => exit_code::USAGE,
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Bridge { .. } | Self::Render(_) | Self::Io(_) => exit_code::GENERAL,
        }
    }

    /// Attach the config file path to a load failure.
    pub fn config(path: &std::path::Path, source: ConfigError) -> Self {
        match source {
            ConfigError::MissingSecret { field } => Self::MissingSecret { field },
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config {
                path: path.display().to_string(),
                source: other,
            },
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::AuthenticationFailed { message } => Self::AuthFailed { message },
            CoreError::Config { message } => Self::Validation {
                field: "config".into(),
                reason: message,
            },
            CoreError::Registry {
                status: Some(401 | 403),
                message,
            } => Self::AuthFailed { message },
            CoreError::Transport { message } => Self::ConnectionFailed {
                what: "the hub".into(),
                message,
            },
            CoreError::ThingSource { message } => Self::ConnectionFailed {
                what: "the gateway".into(),
                message,
            },
            CoreError::Timeout { timeout_secs } => Self::Timeout {
                seconds: timeout_secs,
            },
            other => Self::Bridge {
                message: other.to_string(),
            },
        }
    }
}

impl From<thingbridge_api::Error> for CliError {
    fn from(err: thingbridge_api::Error) -> Self {
        CoreError::from(err).into()
    }
}
