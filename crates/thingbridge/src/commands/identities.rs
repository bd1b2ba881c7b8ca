//! `thingbridge identities`: list hub device identities.

use std::time::Duration;

use serde::Serialize;
use tabled::Tabled;

use thingbridge_api::{RegistryClient, TransportConfig};

use crate::cli::{GlobalOpts, IdentitiesArgs};
use crate::commands;
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct IdentityView {
    device_id: String,
    status: String,
    connection_state: Option<String>,
    last_activity: Option<chrono::DateTime<chrono::Utc>>,
    /// A primary key for this device is stored locally.
    local_key: bool,
}

#[derive(Tabled)]
struct IdentityRow {
    #[tabled(rename = "DEVICE")]
    device_id: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "CONNECTION")]
    connection: String,
    #[tabled(rename = "LAST ACTIVITY")]
    last_activity: String,
    #[tabled(rename = "LOCAL KEY")]
    local_key: &'static str,
}

fn to_row(view: &IdentityView) -> IdentityRow {
    IdentityRow {
        device_id: view.device_id.clone(),
        status: view.status.clone(),
        connection: view.connection_state.clone().unwrap_or_else(|| "-".into()),
        last_activity: view
            .last_activity
            .map_or_else(|| "-".into(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
        local_key: if view.local_key { "yes" } else { "no" },
    }
}

pub async fn handle(args: IdentitiesArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let (path, config) = commands::load(global)?;
    let hub = thingbridge_config::resolve_hub_connection(&config)
        .map_err(|e| CliError::config(&path, e))?;

    let transport = TransportConfig {
        timeout: Duration::from_secs(config.timeout),
        ..TransportConfig::default()
    };
    let registry = RegistryClient::new(&hub, &transport)?;
    let identities = registry.list_devices(args.top).await?;

    let views: Vec<IdentityView> = identities
        .into_iter()
        .map(|identity| IdentityView {
            local_key: config.device(&identity.device_id).is_some(),
            device_id: identity.device_id,
            status: identity.status,
            connection_state: identity.connection_state,
            last_activity: identity.last_activity_time,
        })
        .collect();

    let rendered = output::render_list(&global.output, &views, to_row, |v| v.device_id.clone())?;
    output::print_output(&rendered);
    Ok(())
}
