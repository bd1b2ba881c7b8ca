//! Configuration for thingbridge.
//!
//! TOML file + `THINGBRIDGE_` environment loading (figment), secret
//! resolution (env var → keyring → plaintext), translation to the
//! engine's [`BridgeConfig`], and the file-backed credential store that
//! keeps each device's primary key in the same file.

mod store;

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use url::Url;

use thingbridge_api::{HubConnectionString, TlsMode, TransportConfig};
use thingbridge_core::{BridgeConfig, IdentityStatus};

pub use store::FileCredentialStore;

/// Keyring service name for stored secrets.
pub const KEYRING_SERVICE: &str = "thingbridge";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no {field} configured")]
    MissingSecret { field: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Hub connection string for a shared access policy with registry
    /// read/write rights (plaintext; prefer keyring or env var).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_connection_string: Option<String>,

    /// Environment variable name holding the hub connection string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_connection_string_env: Option<String>,

    /// Base URL of the things gateway.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Gateway access token (plaintext; prefer keyring or env var).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Environment variable name holding the gateway access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_env: Option<String>,

    /// Mirror every batch into the device twin's reported properties.
    #[serde(default)]
    pub update_twin: bool,

    /// Minimum seconds between device status checks. 0 = every event.
    #[serde(default)]
    pub min_check_device_status_interval: u64,

    /// Network timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Status of identities the bridge creates.
    #[serde(default)]
    pub new_device_status: IdentityStatus,

    /// Skip TLS verification towards the gateway.
    #[serde(default)]
    pub insecure: bool,

    /// Custom CA certificate for the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,

    /// Provisioned devices and their primary keys.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hub_connection_string: None,
            hub_connection_string_env: None,
            gateway_url: default_gateway_url(),
            access_token: None,
            access_token_env: None,
            update_twin: false,
            min_check_device_status_interval: 0,
            timeout: default_timeout(),
            new_device_status: IdentityStatus::Enabled,
            insecure: false,
            ca_cert: None,
            devices: Vec::new(),
        }
    }
}

impl Config {
    pub fn device(&self, id: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Set `id`'s primary key, adding the entry if needed.
    pub fn upsert_device(&mut self, id: &str, primary_key: &str) {
        match self.devices.iter_mut().find(|d| d.id == id) {
            Some(entry) => primary_key.clone_into(&mut entry.primary_key),
            None => self.devices.push(DeviceEntry {
                id: id.to_owned(),
                primary_key: primary_key.to_owned(),
            }),
        }
    }
}

/// A provisioned device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceEntry {
    pub id: String,
    #[serde(alias = "primaryKey")]
    pub primary_key: String,
}

fn default_gateway_url() -> String {
    "http://localhost:8080".into()
}
fn default_timeout() -> u64 {
    30
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "thingbridge", "thingbridge").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("thingbridge");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the Config from the canonical path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the Config from `path` + environment.
///
/// A legacy map-form `devices` table in the file is rewritten to list
/// form first.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if migrate_legacy_devices(path)? {
        info!(path = %path.display(), "migrated device list to current format");
    }

    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("THINGBRIDGE_"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Parse a config file's contents without environment overrides.
pub fn parse_config_file(contents: &str) -> Result<Config, ConfigError> {
    let mut table: toml::Table = contents.parse()?;
    normalize_devices(&mut table);
    Ok(table.try_into()?)
}

/// Read only the file at `path`; a missing file is the default config.
pub fn read_config_file(path: &Path) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_config_file(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(e) => Err(e.into()),
    }
}

/// Rewrite a legacy `[devices.<id>]` table in place as `[[devices]]`.
///
/// Returns whether the file was changed.
pub fn migrate_legacy_devices(path: &Path) -> Result<bool, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let mut table: toml::Table = contents.parse()?;
    if !normalize_devices(&mut table) {
        return Ok(false);
    }
    std::fs::write(path, toml::to_string_pretty(&table)?)?;
    Ok(true)
}

/// Convert a map-form `devices` value to list form. Returns whether
/// anything changed.
fn normalize_devices(table: &mut toml::Table) -> bool {
    let Some(toml::Value::Table(legacy)) = table.get("devices") else {
        return false;
    };

    let devices: Vec<toml::Value> = legacy
        .iter()
        .map(|(id, fields)| {
            let mut entry = toml::Table::new();
            entry.insert("id".into(), toml::Value::String(id.clone()));
            if let toml::Value::Table(fields) = fields {
                for (key, value) in fields {
                    let key = if key == "primaryKey" { "primary_key" } else { key };
                    entry.insert(key.to_owned(), value.clone());
                }
            }
            toml::Value::Table(entry)
        })
        .collect();

    table.insert("devices".into(), toml::Value::Array(devices));
    true
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(&config_path(), cfg)
}

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Secret resolution ───────────────────────────────────────────────

/// Resolve a secret: named env var, then keyring, then plaintext.
fn resolve_secret(
    env_name: Option<&str>,
    keyring_entry: &str,
    plaintext: Option<&str>,
    field: &str,
) -> Result<SecretString, ConfigError> {
    // 1. Env var named in config
    if let Some(name) = env_name {
        if let Ok(val) = std::env::var(name) {
            return Ok(SecretString::from(val));
        }
    }

    // 2. System keyring
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, keyring_entry) {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    // 3. Plaintext in config (or THINGBRIDGE_* env via figment)
    if let Some(val) = plaintext.filter(|v| !v.is_empty()) {
        return Ok(SecretString::from(val.to_owned()));
    }

    Err(ConfigError::MissingSecret {
        field: field.into(),
    })
}

/// Resolve and parse the hub connection string.
pub fn resolve_hub_connection(config: &Config) -> Result<HubConnectionString, ConfigError> {
    use secrecy::ExposeSecret;

    let raw = resolve_secret(
        config.hub_connection_string_env.as_deref(),
        "hub-connection-string",
        config.hub_connection_string.as_deref(),
        "hub connection string",
    )?;
    raw.expose_secret()
        .parse()
        .map_err(|e: thingbridge_api::Error| ConfigError::Validation {
            field: "hub_connection_string".into(),
            reason: e.to_string(),
        })
}

/// Resolve the gateway access token.
pub fn resolve_access_token(config: &Config) -> Result<SecretString, ConfigError> {
    resolve_secret(
        config.access_token_env.as_deref(),
        "access-token",
        config.access_token.as_deref(),
        "access token",
    )
}

// ── Translation ─────────────────────────────────────────────────────

/// Everything needed to build a running bridge.
#[derive(Debug)]
pub struct BridgeSettings {
    pub bridge: BridgeConfig,
    pub hub: HubConnectionString,
    pub gateway_url: Url,
    pub access_token: SecretString,
    pub transport: TransportConfig,
}

/// Resolve secrets and build [`BridgeSettings`].
pub fn to_bridge_settings(config: &Config) -> Result<BridgeSettings, ConfigError> {
    if config.timeout == 0 {
        return Err(ConfigError::Validation {
            field: "timeout".into(),
            reason: "must be at least 1 second".into(),
        });
    }

    let hub = resolve_hub_connection(config)?;
    let access_token = resolve_access_token(config)?;
    let gateway_url = parse_gateway_url(config)?;

    let timeout = Duration::from_secs(config.timeout);
    let min_status_check_interval = match config.min_check_device_status_interval {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let tls = if config.insecure {
        TlsMode::DangerAcceptInvalid
    } else if let Some(ref ca_path) = config.ca_cert {
        TlsMode::CustomCa(ca_path.clone())
    } else {
        TlsMode::System
    };

    Ok(BridgeSettings {
        bridge: BridgeConfig {
            hub_host: hub.host_name.clone(),
            sync_twin: config.update_twin,
            min_status_check_interval,
            operation_timeout: timeout,
            new_identity_status: config.new_device_status,
        },
        hub,
        gateway_url,
        access_token,
        transport: TransportConfig { tls, timeout },
    })
}

/// Validate the gateway URL.
pub fn parse_gateway_url(config: &Config) -> Result<Url, ConfigError> {
    config
        .gateway_url
        .parse()
        .map_err(|_| ConfigError::Validation {
            field: "gateway_url".into(),
            reason: format!("invalid URL: {}", config.gateway_url),
        })
}
