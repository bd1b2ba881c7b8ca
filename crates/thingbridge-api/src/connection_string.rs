// ── Hub connection strings ──
//
// `HostName=...;SharedAccessKeyName=...;SharedAccessKey=...` as issued
// for a hub's shared access policy.

use std::fmt;
use std::str::FromStr;

use secrecy::SecretString;

use crate::error::Error;

/// Parsed service-side hub connection string.
///
/// `Debug` never prints the key.
#[derive(Clone)]
pub struct HubConnectionString {
    pub host_name: String,
    pub key_name: String,
    pub key: SecretString,
}

impl fmt::Debug for HubConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConnectionString")
            .field("host_name", &self.host_name)
            .field("key_name", &self.key_name)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl FromStr for HubConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut key_name = None;
        let mut key = None;

        for (name, value) in segments(s)? {
            match name {
                "HostName" => host_name = Some(value),
                "SharedAccessKeyName" => key_name = Some(value),
                "SharedAccessKey" => key = Some(value),
                // DeviceId, GatewayHostName, etc. are irrelevant for the service side.
                _ => {}
            }
        }

        let host_name = host_name.filter(|h| !h.is_empty()).ok_or_else(|| {
            Error::InvalidConnectionString {
                reason: "could not extract HostName".into(),
            }
        })?;
        let key_name = key_name.ok_or_else(|| Error::InvalidConnectionString {
            reason: "missing SharedAccessKeyName".into(),
        })?;
        let key = key.ok_or_else(|| Error::InvalidConnectionString {
            reason: "missing SharedAccessKey".into(),
        })?;

        Ok(Self {
            host_name: host_name.to_owned(),
            key_name: key_name.to_owned(),
            key: SecretString::from(key.to_owned()),
        })
    }
}

/// Split into `(name, value)` pairs. Values may contain `=` (base64 padding),
/// so only the first `=` of each segment separates name from value.
fn segments(s: &str) -> Result<Vec<(&str, &str)>, Error> {
    s.split(';')
        .map(str::trim)
        .filter(|seg| !seg.is_empty())
        .map(|seg| {
            seg.split_once('=')
                .ok_or_else(|| Error::InvalidConnectionString {
                    reason: format!("segment '{}' is not name=value", redact(seg)),
                })
        })
        .collect()
}

fn redact(segment: &str) -> &str {
    segment.split_once('=').map_or(segment, |(name, _)| name)
}
