// ── Identity status ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::DeviceId;

/// Whether a hub identity may publish.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum IdentityStatus {
    #[default]
    Enabled,
    Disabled,
}

impl IdentityStatus {
    /// Parse a registry status string; anything unrecognised gates as disabled.
    pub fn from_wire(status: &str) -> Self {
        status.parse().unwrap_or(Self::Disabled)
    }

    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }
}

/// One entry of a registry listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub device_id: DeviceId,
    pub status: IdentityStatus,
}

impl IdentityRecord {
    pub fn new(device_id: impl Into<DeviceId>, status: IdentityStatus) -> Self {
        Self {
            device_id: device_id.into(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!(IdentityStatus::from_wire("enabled"), IdentityStatus::Enabled);
        assert_eq!(IdentityStatus::from_wire("Enabled"), IdentityStatus::Enabled);
        assert_eq!(IdentityStatus::from_wire("DISABLED"), IdentityStatus::Disabled);
    }

    #[test]
    fn unknown_status_is_disabled() {
        assert_eq!(IdentityStatus::from_wire("suspended"), IdentityStatus::Disabled);
        assert_eq!(IdentityStatus::from_wire(""), IdentityStatus::Disabled);
    }

    #[test]
    fn renders_lowercase() {
        assert_eq!(IdentityStatus::Enabled.to_string(), "enabled");
        assert_eq!(IdentityStatus::Disabled.to_string(), "disabled");
    }
}
