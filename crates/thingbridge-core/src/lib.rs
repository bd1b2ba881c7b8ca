//! Device provisioning and update-coalescing engine.
//!
//! This crate owns the logic between a thing gateway and a device hub:
//!
//! - **[`Bridge`]**: orchestrator. Lists things, subscribes to each one's
//!   property stream, and routes every change through the status gate
//!   into the coalescer.
//!
//! - **[`UpdateCoalescer`]**: one pending [`Batch`] per device. Bursts
//!   collapse into a single flush; at most one batch waits per device.
//!
//! - **[`ConnectionCache`]**: lazily opened device sessions and twins,
//!   rebuilt from a fresh credential when the hub rejects the old one.
//!
//! - **[`StatusGate`]**: rate-limited snapshot of which identities the hub
//!   has disabled.
//!
//! - **[`Provisioner`]**: creates hub identities with random key pairs and
//!   keeps the primary key in a [`CredentialStore`].
//!
//! Every external dependency is a trait in [`hub`]. The [`adapter`]
//! module implements them on top of `thingbridge-api`.

pub mod adapter;
pub mod bridge;
pub mod coalescer;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod hub;
pub mod model;
pub mod provision;
pub mod status;

// ── Primary re-exports ──────────────────────────────────────────────
pub use adapter::{GatewayThings, MqttTransport};
pub use bridge::{Bridge, Collaborators, StartReport};
pub use coalescer::{Admission, BatchSink, FlushReport, HubSink, UpdateCoalescer};
pub use config::BridgeConfig;
pub use connection::ConnectionCache;
pub use credentials::MemoryCredentialStore;
pub use error::CoreError;
pub use hub::{
    CredentialStore, DeviceConnection, DeviceTwin, HubTransport, IdentityRegistry, PropertyChange,
    PropertySubscription, ThingHandle, ThingSource,
};
pub use model::{Batch, Credential, DeviceId, IdentityRecord, IdentityStatus, KeyPair, sanitize};
pub use provision::Provisioner;
pub use status::StatusGate;
