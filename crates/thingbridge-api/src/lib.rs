// thingbridge-api: Async clients for the hub registry, hub device transport, and thing gateway

pub mod connection_string;
pub mod device;
pub mod error;
pub mod registry;
pub mod sas;
pub mod things;
pub mod transport;

pub use connection_string::HubConnectionString;
pub use device::{DeviceClient, DeviceClientOptions, Twin, TwinDocument};
pub use error::Error;
pub use registry::{DeviceIdentity, NewDeviceIdentity, RegistryClient};
pub use things::{PropertyChange, PropertyWatch, ReconnectConfig, ThingDescription, ThingsClient};
pub use transport::{TlsMode, TransportConfig};
