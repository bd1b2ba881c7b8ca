//! Command handlers.

pub mod config_cmd;
pub mod identities;
pub mod run;

use std::path::PathBuf;

use thingbridge_config::Config;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Config file path: `--config` or the platform default.
pub fn config_file(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(thingbridge_config::config_path)
}

/// Load the config file and apply global flag overrides.
pub fn load(global: &GlobalOpts) -> Result<(PathBuf, Config), CliError> {
    let path = config_file(global);
    let mut config =
        thingbridge_config::load_config_from(&path).map_err(|e| CliError::config(&path, e))?;

    if global.insecure {
        config.insecure = true;
    }
    if let Some(timeout) = global.timeout {
        config.timeout = timeout;
    }
    tracing::debug!(path = %path.display(), "loaded configuration");
    Ok((path, config))
}
