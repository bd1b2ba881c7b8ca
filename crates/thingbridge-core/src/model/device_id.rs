// ── Device identifiers ──
//
// A thing id becomes a hub device id by replacing every character the
// hub does not accept with `_`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Punctuation accepted in hub device ids, besides ASCII letters and digits.
const ALLOWED_PUNCTUATION: &str = "-.+%_#*?!(),:=@$'";

/// Whether `c` may appear in a hub device id unchanged.
pub fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || ALLOWED_PUNCTUATION.contains(c)
}

/// Replace every disallowed character with `_`.
///
/// Works per `char`, so a multi-byte character becomes a single `_`.
/// Idempotent: `sanitize(&sanitize(s)) == sanitize(s)`.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if is_allowed_char(c) { c } else { '_' })
        .collect()
}

/// Identifier naming one device on both sides of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap an id that is already in hub form (e.g. from the registry
    /// or the credential file).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the hub device id for a gateway thing id.
    pub fn from_thing_id(thing_id: &str) -> Self {
        Self(sanitize(thing_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
