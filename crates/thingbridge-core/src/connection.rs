// ── Device connection cache ──
//
// At most one open session and one twin per device. Sessions are opened
// lazily; a failed open triggers one credential recreation and one more
// attempt. A session that fails with an auth error is evicted, never
// repaired in place.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::hub::{DeviceConnection, DeviceTwin, HubTransport};
use crate::model::DeviceId;
use crate::provision::Provisioner;

/// Await `fut`, failing with [`CoreError::Timeout`] after `limit`.
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, CoreError>
where
    F: Future<Output = Result<T, CoreError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| CoreError::Timeout {
            timeout_secs: limit.as_secs(),
        })?
}

/// Lazily opened, per-device session and twin cache.
pub struct ConnectionCache {
    host: String,
    transport: Arc<dyn HubTransport>,
    provisioner: Provisioner,
    timeout: Duration,
    connections: DashMap<DeviceId, Arc<dyn DeviceConnection>>,
    twins: DashMap<DeviceId, Arc<dyn DeviceTwin>>,
    open_locks: DashMap<DeviceId, Arc<Mutex<()>>>,
}

impl ConnectionCache {
    pub fn new(
        host: impl Into<String>,
        transport: Arc<dyn HubTransport>,
        provisioner: Provisioner,
        timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            transport,
            provisioner,
            timeout,
            connections: DashMap::new(),
            twins: DashMap::new(),
            open_locks: DashMap::new(),
        }
    }

    /// Bound on each network call made through this cache.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The cached session for `device_id`, opening one if needed.
    ///
    /// Opening loads (or creates) the device credential. If the open
    /// fails, the identity is recreated with a new key and the open is
    /// retried exactly once; a second failure is
    /// [`CoreError::ProvisioningFailed`].
    pub async fn ensure_connection(
        &self,
        device_id: &DeviceId,
    ) -> Result<Arc<dyn DeviceConnection>, CoreError> {
        if let Some(conn) = self.cached_connection(device_id) {
            return Ok(conn);
        }

        let lock = self.open_lock(device_id);
        let _guard = lock.lock().await;

        // Another flush for this device may have opened it while we waited.
        if let Some(conn) = self.cached_connection(device_id) {
            return Ok(conn);
        }

        let credential = bounded(self.timeout, self.provisioner.ensure_identity(device_id))
            .await
            .map_err(|e| provisioning_failed(device_id, &e))?;

        let conn = match bounded(
            self.timeout,
            self.transport.open(&self.host, device_id, &credential),
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "could not open device session");
                self.reopen_with_new_credential(device_id).await?
            }
        };

        info!(device_id = %device_id, "device session open");
        self.connections.insert(device_id.clone(), Arc::clone(&conn));
        Ok(conn)
    }

    /// The cached twin for `device_id`, fetching it through `connection`
    /// if needed.
    ///
    /// A failed fetch recreates the identity, replaces the cached session
    /// with a freshly opened one, and fetches exactly once more.
    pub async fn ensure_twin(
        &self,
        device_id: &DeviceId,
        connection: &Arc<dyn DeviceConnection>,
    ) -> Result<Arc<dyn DeviceTwin>, CoreError> {
        if let Some(twin) = self.cached_twin(device_id) {
            return Ok(twin);
        }

        let lock = self.open_lock(device_id);
        let _guard = lock.lock().await;

        if let Some(twin) = self.cached_twin(device_id) {
            return Ok(twin);
        }

        let twin = match bounded(self.timeout, connection.get_twin()).await {
            Ok(twin) => twin,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "could not fetch twin");
                let conn = self.reopen_with_new_credential(device_id).await?;
                self.replace_connection(device_id, Arc::clone(&conn)).await;
                bounded(self.timeout, conn.get_twin())
                    .await
                    .map_err(|e| provisioning_failed(device_id, &e))?
            }
        };

        debug!(device_id = %device_id, "twin cached");
        self.twins.insert(device_id.clone(), Arc::clone(&twin));
        Ok(twin)
    }

    /// Drop the cached session and twin so the next flush rebuilds them.
    pub async fn invalidate(&self, device_id: &DeviceId) {
        self.twins.remove(device_id);
        if let Some((_, conn)) = self.connections.remove(device_id) {
            info!(device_id = %device_id, "device session invalidated");
            conn.close().await;
        }
    }

    pub fn cached_connection(&self, device_id: &DeviceId) -> Option<Arc<dyn DeviceConnection>> {
        self.connections
            .get(device_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn cached_twin(&self, device_id: &DeviceId) -> Option<Arc<dyn DeviceTwin>> {
        self.twins.get(device_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every cached session.
    pub async fn close_all(&self) {
        self.twins.clear();
        let ids: Vec<DeviceId> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, conn)) = self.connections.remove(&id) {
                conn.close().await;
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────

    /// Recreate the identity and open once with the new key.
    /// Caller holds the device's open lock.
    async fn reopen_with_new_credential(
        &self,
        device_id: &DeviceId,
    ) -> Result<Arc<dyn DeviceConnection>, CoreError> {
        let credential = bounded(self.timeout, self.provisioner.recreate_identity(device_id))
            .await
            .map_err(|e| provisioning_failed(device_id, &e))?;

        bounded(
            self.timeout,
            self.transport.open(&self.host, device_id, &credential),
        )
        .await
        .map_err(|e| provisioning_failed(device_id, &e))
    }

    async fn replace_connection(&self, device_id: &DeviceId, conn: Arc<dyn DeviceConnection>) {
        if let Some(old) = self.connections.insert(device_id.clone(), conn) {
            old.close().await;
        }
    }

    fn open_lock(&self, device_id: &DeviceId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.open_locks
                .entry(device_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }
}

fn provisioning_failed(device_id: &DeviceId, cause: &CoreError) -> CoreError {
    match cause {
        CoreError::ProvisioningFailed { .. } => cause.clone(),
        other => CoreError::ProvisioningFailed {
            device_id: device_id.to_string(),
            reason: other.to_string(),
        },
    }
}
