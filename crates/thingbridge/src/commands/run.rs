//! `thingbridge run`: the long-running bridge.

use std::sync::Arc;

use tracing::{info, warn};

use thingbridge_api::{DeviceClientOptions, ReconnectConfig, RegistryClient, ThingsClient};
use thingbridge_config::FileCredentialStore;
use thingbridge_core::{
    Bridge, Collaborators, Credential, CredentialStore, DeviceId, GatewayThings,
    MemoryCredentialStore, MqttTransport,
};

use crate::cli::{GlobalOpts, RunArgs};
use crate::commands;
use crate::error::CliError;

pub async fn handle(args: RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let (path, mut config) = commands::load(global)?;
    if args.update_twin {
        config.update_twin = true;
    }
    let settings =
        thingbridge_config::to_bridge_settings(&config).map_err(|e| CliError::config(&path, e))?;

    let registry = RegistryClient::new(&settings.hub, &settings.transport)?;
    let things_client = ThingsClient::new(
        settings.gateway_url.clone(),
        settings.access_token,
        &settings.transport,
    )?;
    let transport = MqttTransport::new(DeviceClientOptions {
        request_timeout: settings.bridge.operation_timeout,
        ..DeviceClientOptions::default()
    });

    let credentials: Arc<dyn CredentialStore> = if args.ephemeral_keys {
        Arc::new(MemoryCredentialStore::with_credentials(
            config
                .devices
                .iter()
                .map(|d| (DeviceId::new(&d.id), Credential::new(d.primary_key.clone()))),
        ))
    } else {
        Arc::new(FileCredentialStore::new(&path))
    };

    let status_interval = settings.bridge.min_status_check_interval.map_or_else(
        || "every update".to_owned(),
        |d| humantime::format_duration(d).to_string(),
    );
    info!(
        hub = %settings.hub.host_name,
        gateway = %settings.gateway_url,
        update_twin = settings.bridge.sync_twin,
        status_check = %status_interval,
        ephemeral_keys = args.ephemeral_keys,
        "starting bridge"
    );

    let bridge = Bridge::new(
        &settings.bridge,
        Collaborators {
            registry: Arc::new(registry),
            transport: Arc::new(transport),
            credentials,
            things: Arc::new(GatewayThings::new(things_client, ReconnectConfig::default())),
        },
    );

    let cancel = bridge.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    let report = bridge.start().await?;
    if report.attached.is_empty() {
        warn!("no things attached; waiting for interrupt");
    }
    info!(
        attached = report.attached.len(),
        failed = report.failed.len(),
        "bridge running"
    );

    bridge.cancellation_token().cancelled().await;
    bridge.shutdown().await;
    info!("bridge stopped");
    Ok(())
}
