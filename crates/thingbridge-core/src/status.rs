// ── Device status gate ──
//
// Snapshot of which devices the hub has disabled. Refreshed as a whole
// from the registry, no more often than the configured minimum interval.
// A failed refresh keeps the previous snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::time::Instant;
use tracing::debug;

use crate::connection::bounded;
use crate::error::CoreError;
use crate::hub::IdentityRegistry;
use crate::model::DeviceId;

/// Gates updates on the hub-side enabled/disabled status.
pub struct StatusGate {
    registry: Arc<dyn IdentityRegistry>,
    min_interval: Option<Duration>,
    timeout: Duration,
    disabled: ArcSwap<HashMap<DeviceId, bool>>,
    last_refresh: Mutex<Option<Instant>>,
}

impl StatusGate {
    pub fn new(
        registry: Arc<dyn IdentityRegistry>,
        min_interval: Option<Duration>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            min_interval,
            timeout,
            disabled: ArcSwap::from_pointee(HashMap::new()),
            last_refresh: Mutex::new(None),
        }
    }

    /// Whether the last snapshot marks `device_id` disabled. Devices the
    /// snapshot does not know about pass.
    pub fn is_disabled(&self, device_id: &DeviceId) -> bool {
        self.disabled.load().get(device_id).copied().unwrap_or(false)
    }

    /// Refresh if the snapshot is older than the minimum interval.
    ///
    /// Returns whether a refresh was attempted. The refresh time is
    /// claimed before the registry call, so concurrent callers do not
    /// all hit the registry.
    pub async fn refresh_if_stale(&self, now: Instant) -> Result<bool, CoreError> {
        if !self.claim(now, false) {
            return Ok(false);
        }
        self.reload().await.map(|()| true)
    }

    /// Refresh unconditionally.
    pub async fn refresh(&self, now: Instant) -> Result<(), CoreError> {
        self.claim(now, true);
        self.reload().await
    }

    /// When the last refresh was attempted.
    pub fn last_refresh(&self) -> Option<Instant> {
        *self.last_refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of devices in the snapshot marked disabled.
    pub fn disabled_count(&self) -> usize {
        self.disabled.load().values().filter(|d| **d).count()
    }

    fn claim(&self, now: Instant, force: bool) -> bool {
        let mut last = self
            .last_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let stale = force
            || match (*last, self.min_interval) {
                (None, _) | (Some(_), None) => true,
                (Some(_), Some(min)) if min.is_zero() => true,
                (Some(prev), Some(min)) => now.saturating_duration_since(prev) > min,
            };

        if stale {
            *last = Some(now);
        }
        stale
    }

    async fn reload(&self) -> Result<(), CoreError> {
        let records = bounded(self.timeout, self.registry.list_identities()).await?;
        let snapshot: HashMap<DeviceId, bool> = records
            .into_iter()
            .map(|r| (r.device_id, !r.status.is_enabled()))
            .collect();

        debug!(
            devices = snapshot.len(),
            disabled = snapshot.values().filter(|d| **d).count(),
            "device status refreshed"
        );
        self.disabled.store(Arc::new(snapshot));
        Ok(())
    }
}
