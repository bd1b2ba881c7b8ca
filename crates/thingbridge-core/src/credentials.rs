// ── In-process credential store ──

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::CoreError;
use crate::hub::CredentialStore;
use crate::model::{Credential, DeviceId};

/// Credentials kept only for the life of the process.
///
/// Used for dry runs and tests; nothing survives a restart, so every
/// device is re-provisioned on the next start.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    keys: DashMap<DeviceId, Credential>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the store.
    pub fn with_credentials(entries: impl IntoIterator<Item = (DeviceId, Credential)>) -> Self {
        Self {
            keys: entries.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, device_id: &DeviceId) -> Result<Option<Credential>, CoreError> {
        Ok(self.keys.get(device_id).map(|entry| entry.value().clone()))
    }

    async fn put(&self, device_id: &DeviceId, credential: &Credential) -> Result<(), CoreError> {
        self.keys.insert(device_id.clone(), credential.clone());
        Ok(())
    }
}
