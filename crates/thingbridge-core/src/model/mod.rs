// ── Engine domain model ──
//
// Identifiers, credentials, identity status, and the per-device batch
// buffer. Nothing here touches the network.

pub mod batch;
pub mod credential;
pub mod device_id;
pub mod identity;

pub use batch::Batch;
pub use credential::{Credential, KeyPair};
pub use device_id::{DeviceId, is_allowed_char, sanitize};
pub use identity::{IdentityRecord, IdentityStatus};
