//! Local network client for TP-Link Kasa smart home devices.
//!
//! Kasa firmware speaks one of two protocols:
//!
//! - **Legacy**: JSON over TCP port 9999, obfuscated with an XOR autokey
//!   cipher (initial key 171) and framed with a 4-byte big-endian length.
//! - **KLAP**: JSON over HTTP, encrypted with AES-128-CBC after a two-step
//!   seed handshake that proves both sides hold the same credential hash.
//!
//! [`DeviceClient`] hides the difference. It negotiates the protocol on
//! first contact, keeps one session per device address, and normalizes
//! replies into [`DeviceInfo`] and [`EnergyReading`]. [`Discoverer`] finds
//! devices with UDP broadcast probes and queries them concurrently.
//!
//! # Example
//!
//! ```no_run
//! use kasa_bridge_core::{ClientConfig, Credentials, DeviceClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kasa_bridge_core::Error> {
//!     let config = ClientConfig::default()
//!         .with_credentials(Some(Credentials::new("me@example.com", "hunter2")));
//!     let client = DeviceClient::new(config);
//!
//!     let addr = "192.168.1.100".parse()?;
//!     let info = client.update(&addr).await?;
//!     println!("{} is {}", info.alias, if info.is_on { "on" } else { "off" });
//!
//!     if let Some(energy) = client.energy(&addr).await? {
//!         println!("drawing {:.1} W", energy.current_power);
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod commands;
pub mod credentials;
pub mod crypto;
pub mod device;
pub mod discovery;
pub mod error;
pub mod net;
pub mod response;
pub mod transport;

pub use client::{ClientConfig, DeviceAddress, DeviceClient};
pub use credentials::{Credentials, DefaultCredentials};
pub use device::{Capabilities, ChildDevice, DeviceInfo, DeviceType, EnergyReading};
pub use discovery::{
    BatchReport, DeviceFailure, Discoverer, DiscoveryConfig, DiscoveryReport, ProbeKind,
    ProbeTarget,
};
pub use error::Error;
pub use transport::{DEFAULT_TIMEOUT, EncryptionType};

/// The version of the kasa-bridge-core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
