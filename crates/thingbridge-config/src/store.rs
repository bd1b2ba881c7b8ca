// ── File-backed credential store ──
//
// Primary keys live in the config file's `[[devices]]` list. Reads and
// read-modify-write cycles are serialized behind one async mutex and
// run on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use thingbridge_core::{CoreError, Credential, CredentialStore, DeviceId};

use crate::{ConfigError, read_config_file, save_config_to};

/// Credential store persisting into a config file.
///
/// Only the file is consulted; `THINGBRIDGE_*` overrides never leak
/// into what is written back.
pub struct FileCredentialStore {
    path: Arc<PathBuf>,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, ConfigError> + Send + 'static,
    {
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || op(&path))
            .await
            .map_err(|e| CoreError::Internal(format!("credential store task failed: {e}")))?
            .map_err(|e| CoreError::CredentialStore {
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, device_id: &DeviceId) -> Result<Option<Credential>, CoreError> {
        let _guard = self.lock.lock().await;
        let id = device_id.to_string();
        self.blocking(move |path| {
            let config = read_config_file(path)?;
            Ok(config.device(&id).map(|d| Credential::new(d.primary_key.clone())))
        })
        .await
    }

    async fn put(&self, device_id: &DeviceId, credential: &Credential) -> Result<(), CoreError> {
        let _guard = self.lock.lock().await;
        let id = device_id.to_string();
        let key = credential.expose().to_owned();
        self.blocking(move |path| {
            let mut config = read_config_file(path)?;
            config.upsert_device(&id, &key);
            save_config_to(path, &config)
        })
        .await?;
        debug!(device_id = %device_id, "primary key saved");
        Ok(())
    }
}
