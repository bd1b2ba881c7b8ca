// ── Runtime engine configuration ──
//
// Tuning for one `Bridge`. Built by the binary from the on-disk config;
// the engine itself never reads files.

use std::time::Duration;

use crate::model::IdentityStatus;

/// Default bound on every registry, transport, and twin call.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a running bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Hub host name, e.g. `myhub.azure-devices.net`.
    pub hub_host: String,
    /// Mirror every batch into the device twin's reported properties.
    pub sync_twin: bool,
    /// Minimum time between device status refreshes.
    /// `None` or zero refreshes on every event.
    pub min_status_check_interval: Option<Duration>,
    /// Bound on each network call.
    pub operation_timeout: Duration,
    /// Status given to identities the bridge creates.
    pub new_identity_status: IdentityStatus,
}

impl BridgeConfig {
    pub fn new(hub_host: impl Into<String>) -> Self {
        Self {
            hub_host: hub_host.into(),
            sync_twin: false,
            min_status_check_interval: None,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            new_identity_status: IdentityStatus::Enabled,
        }
    }
}
