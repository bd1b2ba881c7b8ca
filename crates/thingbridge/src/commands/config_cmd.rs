//! Config subcommand handlers.

use std::io::BufRead;

use thingbridge_config::{Config, KEYRING_SERVICE};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, SecretName};
use crate::commands;
use crate::error::CliError;
use crate::output;

const REDACTED: &str = "********";

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&commands::config_file(global).display().to_string());
            Ok(())
        }

        ConfigCommand::Show => {
            let (_, config) = commands::load(global)?;
            let redacted = redact(config);
            let rendered = output::render_single(&global.output, &redacted, |cfg| {
                toml::to_string_pretty(cfg).map_err(|e| CliError::Render(e.to_string()))
            })?;
            output::print_output(rendered.trim_end());
            Ok(())
        }

        ConfigCommand::SetSecret { name } => set_secret(name),
    }
}

/// Replace every secret with a placeholder.
fn redact(mut config: Config) -> Config {
    if config.hub_connection_string.is_some() {
        config.hub_connection_string = Some(REDACTED.into());
    }
    if config.access_token.is_some() {
        config.access_token = Some(REDACTED.into());
    }
    for device in &mut config.devices {
        device.primary_key = REDACTED.into();
    }
    config
}

fn set_secret(name: SecretName) -> Result<(), CliError> {
    let mut value = String::new();
    std::io::stdin().lock().read_line(&mut value)?;
    let value = value.trim();
    if value.is_empty() {
        return Err(CliError::Validation {
            field: name.entry().into(),
            reason: "no value on stdin".into(),
        });
    }

    let keyring_err = |e: keyring::Error| CliError::Keyring {
        message: e.to_string(),
    };
    keyring::Entry::new(KEYRING_SERVICE, name.entry())
        .map_err(keyring_err)?
        .set_password(value)
        .map_err(keyring_err)?;

    eprintln!("Stored {} in the system keyring", name.entry());
    Ok(())
}
