// ── Collaborator seams ──
//
// Everything the engine needs from the outside world. Production
// implementations live in `adapter`; tests substitute in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::model::{Credential, DeviceId, IdentityRecord, IdentityStatus, KeyPair};

// ── Hub side ─────────────────────────────────────────────────────────

/// Service-side identity registry of the hub.
#[async_trait]
pub trait IdentityRegistry: Send + Sync {
    /// Every identity known to the hub with its status.
    async fn list_identities(&self) -> Result<Vec<IdentityRecord>, CoreError>;

    /// Create `device_id` with `keys`, replacing any existing identity.
    async fn create_identity(
        &self,
        device_id: &DeviceId,
        status: IdentityStatus,
        keys: &KeyPair,
    ) -> Result<(), CoreError>;
}

/// Opens device sessions.
#[async_trait]
pub trait HubTransport: Send + Sync {
    /// Authenticate as `device_id`. A rejected key is
    /// [`CoreError::AuthenticationFailed`].
    async fn open(
        &self,
        host: &str,
        device_id: &DeviceId,
        credential: &Credential,
    ) -> Result<Arc<dyn DeviceConnection>, CoreError>;
}

/// One open device session.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    /// Publish a telemetry event.
    async fn send_event(&self, payload: Vec<u8>) -> Result<(), CoreError>;

    /// Fetch the device twin.
    async fn get_twin(&self) -> Result<Arc<dyn DeviceTwin>, CoreError>;

    /// Release the session. Default: nothing to release.
    async fn close(&self) {}
}

/// A fetched device twin.
#[async_trait]
pub trait DeviceTwin: Send + Sync {
    /// Merge `patch` into the reported properties.
    async fn update_reported(&self, patch: &Value) -> Result<(), CoreError>;
}

/// Persists one primary key per device.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, device_id: &DeviceId) -> Result<Option<Credential>, CoreError>;

    /// Store `credential`, overwriting any previous one.
    async fn put(&self, device_id: &DeviceId, credential: &Credential) -> Result<(), CoreError>;
}

// ── Thing side ───────────────────────────────────────────────────────

/// A property value change on one thing.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub property: String,
    pub value: Value,
}

impl PropertyChange {
    pub fn new(property: impl Into<String>, value: Value) -> Self {
        Self {
            property: property.into(),
            value,
        }
    }
}

/// Property changes of one connected thing, in arrival order.
pub type PropertySubscription = mpsc::Receiver<PropertyChange>;

/// Lists the things to bridge.
#[async_trait]
pub trait ThingSource: Send + Sync {
    async fn list_things(&self) -> Result<Vec<Arc<dyn ThingHandle>>, CoreError>;
}

/// One thing on the gateway.
#[async_trait]
pub trait ThingHandle: Send + Sync {
    /// Gateway-local id, before sanitization.
    fn id(&self) -> &str;

    fn title(&self) -> &str;

    /// Subscribe to property changes until `cancel` fires.
    async fn connect(&self, cancel: CancellationToken) -> Result<PropertySubscription, CoreError>;
}
