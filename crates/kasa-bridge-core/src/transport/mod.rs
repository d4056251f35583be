//! Transport layer for talking to Kasa devices.
//!
//! - [`LegacyTransport`]: XOR-encoded JSON over TCP 9999 (older firmware)
//! - [`KlapTransport`]: signed AES over HTTP on port 80 (newer firmware)
//!
//! [`connect`] picks one by trial: the hinted variant first, then KLAP, then
//! legacy.

pub mod klap;
pub mod legacy;

pub use klap::{KlapState, KlapTransport};
pub use legacy::LegacyTransport;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Credentials, error::Error};

/// Default timeout for a single network round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol variant spoken by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionType {
    /// Legacy XOR protocol on TCP 9999, no authentication.
    Xor,
    /// KLAP over HTTP, authenticated.
    Klap,
    /// Tapo-style AES over HTTP. Reported by discovery but not spoken.
    Aes,
}

impl std::fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptionType::Xor => write!(f, "XOR"),
            EncryptionType::Klap => write!(f, "KLAP"),
            EncryptionType::Aes => write!(f, "AES"),
        }
    }
}

/// Everything [`connect`] needs to reach one device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub ip: IpAddr,
    /// Port override. `None` uses each variant's own port.
    pub port: Option<u16>,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
    /// Variant to try first (from discovery or an earlier session).
    pub encryption_hint: Option<EncryptionType>,
    pub klap_port: u16,
    pub legacy_port: u16,
    pub session_refresh_margin: Duration,
}

impl DeviceConfig {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            port: None,
            credentials: None,
            timeout: DEFAULT_TIMEOUT,
            encryption_hint: None,
            klap_port: klap::DEFAULT_PORT,
            legacy_port: legacy::DEFAULT_PORT,
            session_refresh_margin: klap::DEFAULT_REFRESH_MARGIN,
        }
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_encryption_hint(mut self, hint: Option<EncryptionType>) -> Self {
        self.encryption_hint = hint;
        self
    }

    /// Socket address used for `variant`.
    pub fn addr_for(&self, variant: EncryptionType) -> SocketAddr {
        let default = match variant {
            EncryptionType::Xor => self.legacy_port,
            EncryptionType::Klap | EncryptionType::Aes => self.klap_port,
        };
        SocketAddr::new(self.ip, self.port.unwrap_or(default))
    }

    /// Variants to try, in order, without repeats.
    pub fn trial_order(&self) -> Vec<EncryptionType> {
        let mut order = Vec::with_capacity(2);
        if let Some(hint) = self.encryption_hint
            && hint != EncryptionType::Aes
        {
            order.push(hint);
        }
        for variant in [EncryptionType::Klap, EncryptionType::Xor] {
            if !order.contains(&variant) {
                order.push(variant);
            }
        }
        order
    }
}

/// Connects by trying each variant in [`DeviceConfig::trial_order`].
///
/// The first variant that answers wins. If all fail, an authentication
/// failure is reported in preference to anything else, then the first
/// non-transient failure, then the last transient one.
///
/// ```no_run
/// use kasa_bridge_core::transport::{DeviceConfig, Transport, connect};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut transport = connect(&DeviceConfig::new("192.168.1.100".parse()?)).await?;
///     let response = transport.send(r#"{"system":{"get_sysinfo":{}}}"#).await?;
///     println!("{}", response);
///     Ok(())
/// }
/// ```
pub async fn connect(config: &DeviceConfig) -> Result<Box<dyn Transport>, Error> {
    let mut errors = Vec::new();

    for variant in config.trial_order() {
        let addr = config.addr_for(variant);
        debug!(%addr, %variant, "trying protocol variant");
        let attempt: Result<Box<dyn Transport>, Error> = match variant {
            EncryptionType::Klap => {
                let mut transport =
                    KlapTransport::new(addr, config.credentials.clone(), config.timeout)
                        .with_refresh_margin(config.session_refresh_margin);
                match transport.handshake().await {
                    Ok(()) => Ok(Box::new(transport)),
                    Err(e) => Err(e),
                }
            }
            EncryptionType::Xor => LegacyTransport::connect(addr, config.timeout)
                .await
                .map(|t| Box::new(t) as Box<dyn Transport>),
            EncryptionType::Aes => continue,
        };

        match attempt {
            Ok(transport) => {
                debug!(%addr, %variant, "protocol variant selected");
                return Ok(transport);
            }
            Err(e) => {
                debug!(%addr, %variant, error = %e, "protocol variant failed");
                errors.push(e);
            }
        }
    }

    Err(pick_error(errors, config.ip))
}

fn pick_error(mut errors: Vec<Error>, ip: IpAddr) -> Error {
    if let Some(auth) = errors
        .iter()
        .find(|e| matches!(e, Error::AuthenticationFailed(_)))
    {
        return auth.clone();
    }
    if let Some(hard) = errors.iter().find(|e| !e.is_transient()) {
        return hard.clone();
    }
    errors
        .pop()
        .unwrap_or_else(|| Error::ConnectionFailed(format!("no protocol variant to try for {ip}")))
}

/// A connection to one device over one protocol variant.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a JSON command and returns the JSON reply text.
    async fn send(&mut self, command: &str) -> Result<String, Error>;

    fn encryption_type(&self) -> EncryptionType;

    /// Endpoint this transport talks to.
    fn addr(&self) -> SocketAddr;
}
