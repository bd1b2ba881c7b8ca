// ── Collaborators backed by thingbridge-api ──
//
// Registry REST client, MQTT device sessions, and the gateway's thing
// listing and property streams, each behind the engine's traits.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thingbridge_api::registry::DEFAULT_LIST_TOP;
use thingbridge_api::{
    DeviceClient, DeviceClientOptions, NewDeviceIdentity, ReconnectConfig, RegistryClient,
    ThingsClient, Twin,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CoreError;
use crate::hub::{
    DeviceConnection, DeviceTwin, HubTransport, IdentityRegistry, PropertyChange,
    PropertySubscription, ThingHandle, ThingSource,
};
use crate::model::{Credential, DeviceId, IdentityRecord, IdentityStatus, KeyPair};

const SUBSCRIPTION_CAPACITY: usize = 256;

// ── Registry ─────────────────────────────────────────────────────────

#[async_trait]
impl IdentityRegistry for RegistryClient {
    async fn list_identities(&self) -> Result<Vec<IdentityRecord>, CoreError> {
        let devices = self.list_devices(DEFAULT_LIST_TOP).await?;
        Ok(devices
            .into_iter()
            .map(|d| IdentityRecord::new(DeviceId::new(d.device_id), IdentityStatus::from_wire(&d.status)))
            .collect())
    }

    async fn create_identity(
        &self,
        device_id: &DeviceId,
        status: IdentityStatus,
        keys: &KeyPair,
    ) -> Result<(), CoreError> {
        let identity = NewDeviceIdentity::with_symmetric_key(
            device_id.as_str(),
            status.to_string(),
            keys.primary.expose(),
            keys.secondary.expose(),
        );
        self.create_or_update_device(&identity).await?;
        Ok(())
    }
}

// ── Device sessions ──────────────────────────────────────────────────

/// Opens [`DeviceClient`] MQTT sessions.
#[derive(Debug, Clone, Default)]
pub struct MqttTransport {
    options: DeviceClientOptions,
}

impl MqttTransport {
    pub fn new(options: DeviceClientOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl HubTransport for MqttTransport {
    async fn open(
        &self,
        host: &str,
        device_id: &DeviceId,
        credential: &Credential,
    ) -> Result<Arc<dyn DeviceConnection>, CoreError> {
        let client =
            DeviceClient::open(host, device_id.as_str(), credential.secret(), &self.options).await?;
        Ok(Arc::new(client))
    }
}

#[async_trait]
impl DeviceConnection for DeviceClient {
    async fn send_event(&self, payload: Vec<u8>) -> Result<(), CoreError> {
        Ok(DeviceClient::send_event(self, payload).await?)
    }

    async fn get_twin(&self) -> Result<Arc<dyn DeviceTwin>, CoreError> {
        let twin = DeviceClient::get_twin(self).await?;
        Ok(Arc::new(twin))
    }

    async fn close(&self) {
        DeviceClient::close(self).await;
    }
}

#[async_trait]
impl DeviceTwin for Twin {
    async fn update_reported(&self, patch: &Value) -> Result<(), CoreError> {
        Ok(Twin::update_reported(self, patch).await?)
    }
}

// ── Things ───────────────────────────────────────────────────────────

/// Things listed by a WebThings gateway.
pub struct GatewayThings {
    client: Arc<ThingsClient>,
    reconnect: ReconnectConfig,
}

impl GatewayThings {
    pub fn new(client: ThingsClient, reconnect: ReconnectConfig) -> Self {
        Self {
            client: Arc::new(client),
            reconnect,
        }
    }
}

#[async_trait]
impl ThingSource for GatewayThings {
    async fn list_things(&self) -> Result<Vec<Arc<dyn ThingHandle>>, CoreError> {
        let things = self.client.list_things().await?;
        Ok(things
            .iter()
            .filter_map(|thing| {
                let Some(id) = thing.thing_id() else {
                    debug!(title = thing.display_title(), "skipping thing without id");
                    return None;
                };
                Some(Arc::new(GatewayThing {
                    client: Arc::clone(&self.client),
                    reconnect: self.reconnect.clone(),
                    id: id.to_owned(),
                    title: thing.display_title().to_owned(),
                }) as Arc<dyn ThingHandle>)
            })
            .collect())
    }
}

struct GatewayThing {
    client: Arc<ThingsClient>,
    reconnect: ReconnectConfig,
    id: String,
    title: String,
}

#[async_trait]
impl ThingHandle for GatewayThing {
    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    async fn connect(&self, cancel: CancellationToken) -> Result<PropertySubscription, CoreError> {
        let watch = self
            .client
            .watch_properties(&self.id, self.reconnect.clone(), cancel)
            .await?;
        let (mut source, _cancel) = watch.into_parts();

        // Ends when the stream gives up or the subscriber goes away.
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        tokio::spawn(async move {
            while let Some(change) = source.recv().await {
                let change = PropertyChange::new(change.property, change.value);
                if tx.send(change).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
