// ── Identity provisioning ──
//
// Maps a device id to a usable primary key: load it from the store, or
// generate a key pair, register the identity, and persist the primary.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::CoreError;
use crate::hub::{CredentialStore, IdentityRegistry};
use crate::model::{Credential, DeviceId, IdentityStatus, KeyPair};

/// Creates hub identities on demand and keeps their keys in a store.
pub struct Provisioner {
    registry: Arc<dyn IdentityRegistry>,
    store: Arc<dyn CredentialStore>,
    initial_status: IdentityStatus,
}

impl Provisioner {
    pub fn new(
        registry: Arc<dyn IdentityRegistry>,
        store: Arc<dyn CredentialStore>,
        initial_status: IdentityStatus,
    ) -> Self {
        Self {
            registry,
            store,
            initial_status,
        }
    }

    /// The stored credential for `device_id`, creating the identity if
    /// none is stored.
    pub async fn ensure_identity(&self, device_id: &DeviceId) -> Result<Credential, CoreError> {
        debug!(device_id = %device_id, "loading primary key");
        if let Some(credential) = self.store.get(device_id).await? {
            return Ok(credential);
        }
        info!(device_id = %device_id, "no stored key, creating identity");
        self.create(device_id).await
    }

    /// Register a brand-new key pair for `device_id` and overwrite the
    /// stored credential.
    pub async fn recreate_identity(&self, device_id: &DeviceId) -> Result<Credential, CoreError> {
        info!(device_id = %device_id, "recreating identity");
        self.create(device_id).await
    }

    async fn create(&self, device_id: &DeviceId) -> Result<Credential, CoreError> {
        let keys = KeyPair::generate();
        self.registry
            .create_identity(device_id, self.initial_status, &keys)
            .await?;

        let primary = keys.into_primary();
        self.store.put(device_id, &primary).await?;
        info!(device_id = %device_id, status = %self.initial_status, "identity created, primary key saved");
        Ok(primary)
    }
}
