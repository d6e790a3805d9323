// fleetsync-api: async clients for Gen1 (REST/Basic) and Gen2 (RPC/Digest) devices

pub mod auth;
pub mod client;
pub mod context;
pub mod digest;
pub mod error;
pub mod gen1;
pub mod gen2;
pub mod probe;
pub mod transport;

pub use auth::{AuthScheme, Credentials, Generation};
pub use client::{
    Component, ComponentValue, DeviceClient, DeviceInfo, RollerCommand, SettingsOutcome,
    SettingsWrite,
};
pub use context::CallContext;
pub use error::{Error, ErrorClass};
pub use gen1::Gen1Client;
pub use gen2::Gen2Client;
pub use probe::identify;
pub use transport::TransportConfig;
