// ── Update coalescer ──
//
// One pending batch per device. The first update for an idle device
// registers a batch and spawns a flush; updates arriving before that
// flush starts merge into the batch. The flush takes the batch out of
// the table as its first step, so later updates start a new batch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionCache, bounded};
use crate::error::CoreError;
use crate::hub::{DeviceConnection, DeviceTwin};
use crate::model::{Batch, DeviceId};

/// What `on_property_changed` did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new batch was registered and a flush spawned.
    Started,
    /// The update joined the pending batch.
    Merged,
}

/// Outcome of one flush.
#[derive(Debug, Clone)]
pub struct FlushReport {
    pub telemetry: Result<(), CoreError>,
    /// `None` when twin sync is off.
    pub twin: Option<Result<(), CoreError>>,
}

impl FlushReport {
    pub fn is_success(&self) -> bool {
        self.telemetry.is_ok() && self.twin.as_ref().is_none_or(Result::is_ok)
    }
}

/// Where batches go once a flush starts.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn flush(&self, device_id: &DeviceId, batch: Batch) -> FlushReport;
}

// ── UpdateCoalescer ──────────────────────────────────────────────────

/// Per-device batching with at most one pending batch per device.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct UpdateCoalescer {
    inner: Arc<Inner>,
}

struct Inner {
    batches: Mutex<HashMap<DeviceId, Batch>>,
    sink: Arc<dyn BatchSink>,
    tracker: TaskTracker,
}

impl UpdateCoalescer {
    pub fn new(sink: Arc<dyn BatchSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                batches: Mutex::new(HashMap::new()),
                sink,
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Record one property update. Never blocks on I/O.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn on_property_changed(
        &self,
        device_id: &DeviceId,
        property: &str,
        value: Value,
    ) -> Admission {
        {
            let mut batches = self.inner.lock_batches();
            if let Some(batch) = batches.get_mut(device_id) {
                debug!(device_id = %device_id, property, "adding to pending batch");
                batch.upsert(property, value);
                return Admission::Merged;
            }
            batches.insert(device_id.clone(), Batch::single(property, value));
        }

        debug!(device_id = %device_id, property, "creating batch");
        let inner = Arc::clone(&self.inner);
        let device_id = device_id.clone();
        self.inner.tracker.spawn(async move {
            inner.flush(device_id).await;
        });
        Admission::Started
    }

    /// Snapshot of the batch waiting for its flush to start.
    pub fn pending(&self, device_id: &DeviceId) -> Option<Batch> {
        self.inner.lock_batches().get(device_id).cloned()
    }

    /// Number of devices with a batch waiting.
    pub fn pending_count(&self) -> usize {
        self.inner.lock_batches().len()
    }

    /// Number of flushes still running.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Stop accepting new flushes and wait for running ones.
    pub async fn shutdown(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl Inner {
    fn lock_batches(&self) -> MutexGuard<'_, HashMap<DeviceId, Batch>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn flush(&self, device_id: DeviceId) {
        let Some(batch) = self.lock_batches().remove(&device_id) else {
            return;
        };

        let report = self.sink.flush(&device_id, batch).await;
        if report.is_success() {
            debug!(device_id = %device_id, "flush complete");
        }
    }
}

// ── HubSink ──────────────────────────────────────────────────────────

/// Sends each batch as a telemetry event and, optionally, as a reported
/// twin patch.
pub struct HubSink {
    cache: Arc<ConnectionCache>,
    sync_twin: bool,
}

impl HubSink {
    pub fn new(cache: Arc<ConnectionCache>, sync_twin: bool) -> Self {
        Self { cache, sync_twin }
    }

    async fn send_telemetry(
        &self,
        device_id: &DeviceId,
        connection: &Result<Arc<dyn DeviceConnection>, CoreError>,
        payload: &Value,
    ) -> Result<(), CoreError> {
        let conn = connection.as_ref().map_err(Clone::clone)?;
        let bytes = serde_json::to_vec(payload).map_err(|e| CoreError::Internal(e.to_string()))?;

        debug!(device_id = %device_id, event = %payload, "sending event");
        let result = bounded(self.cache.timeout(), conn.send_event(bytes)).await;
        self.invalidate_on_session_error(device_id, &result).await;
        result?;

        info!(device_id = %device_id, event = %payload, "sent event");
        Ok(())
    }

    async fn update_twin(
        &self,
        device_id: &DeviceId,
        connection: &Result<Arc<dyn DeviceConnection>, CoreError>,
        payload: &Value,
    ) -> Result<(), CoreError> {
        let twin: Arc<dyn DeviceTwin> = match (self.cache.cached_twin(device_id), connection) {
            (Some(twin), _) => twin,
            (None, Ok(_)) => {
                // The telemetry half may have invalidated the session.
                let Some(current) = self.cache.cached_connection(device_id) else {
                    debug!(device_id = %device_id, "session closed during flush, skipping twin");
                    return Err(CoreError::SessionClosed);
                };
                self.cache.ensure_twin(device_id, &current).await?
            }
            (None, Err(e)) => return Err(e.clone()),
        };

        debug!(device_id = %device_id, patch = %payload, "applying batch to twin");
        let result = bounded(self.cache.timeout(), twin.update_reported(payload)).await;
        self.invalidate_on_session_error(device_id, &result).await;
        result?;

        info!(device_id = %device_id, patch = %payload, "updated twin");
        Ok(())
    }

    async fn invalidate_on_session_error(&self, device_id: &DeviceId, result: &Result<(), CoreError>) {
        if matches!(result, Err(e) if e.invalidates_session()) {
            self.cache.invalidate(device_id).await;
        }
    }
}

#[async_trait]
impl BatchSink for HubSink {
    async fn flush(&self, device_id: &DeviceId, batch: Batch) -> FlushReport {
        let payload = batch.to_json();
        let connection = self.cache.ensure_connection(device_id).await;
        if let Err(e) = &connection {
            error!(device_id = %device_id, error = %e, batch = %payload, "could not obtain device session");
        }

        let telemetry = self.send_telemetry(device_id, &connection, &payload).await;
        if let (Ok(_), Err(e)) = (&connection, &telemetry) {
            warn!(device_id = %device_id, error = %e, "could not send event");
        }

        let twin = if self.sync_twin {
            let result = self.update_twin(device_id, &connection, &payload).await;
            if let Err(e) = &result {
                warn!(device_id = %device_id, error = %e, "could not update twin");
            }
            Some(result)
        } else {
            None
        };

        FlushReport { telemetry, twin }
    }
}
