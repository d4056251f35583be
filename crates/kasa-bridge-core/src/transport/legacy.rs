//! Legacy XOR transport for older Kasa firmware.
//!
//! One TCP connection per request on port 9999: a length-prefixed autokey
//! frame goes out, a 4-byte big-endian length and the encoded payload come
//! back. There is no authentication and no session state.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::{
    commands,
    crypto::xor,
    error::Error,
    net,
    transport::{EncryptionType, Transport},
};

/// Default port for the legacy protocol.
pub const DEFAULT_PORT: u16 = 9999;

/// Replies larger than this are treated as garbage.
const MAX_PAYLOAD: usize = 1024 * 1024;

/// Transport using the legacy XOR protocol over TCP.
///
/// ```no_run
/// use kasa_bridge_core::transport::{LegacyTransport, Transport};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut transport =
///         LegacyTransport::new("192.168.1.100:9999".parse()?, Duration::from_secs(10));
///     let response = transport.send(r#"{"system":{"get_sysinfo":{}}}"#).await?;
///     println!("{}", response);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct LegacyTransport {
    addr: SocketAddr,
    timeout: Duration,
    /// Sysinfo reply from [`connect`](Self::connect), served to the first
    /// send if that send is the same query.
    sysinfo_reply: Option<String>,
}

impl LegacyTransport {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            sysinfo_reply: None,
        }
    }

    /// Creates a transport and checks that the endpoint answers a sysinfo
    /// query in the legacy framing.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, Error> {
        let mut transport = Self::new(addr, timeout);
        let reply = transport.exchange(commands::INFO).await?;
        serde_json::from_str::<serde_json::Value>(&reply)
            .map_err(|e| Error::MalformedResponse(format!("legacy probe reply: {e}")))?;
        transport.sysinfo_reply = Some(reply);
        Ok(transport)
    }

    async fn exchange(&self, command: &str) -> Result<String, Error> {
        debug!(addr = %self.addr, "connecting");
        let mut stream = net::connect(self.addr, self.timeout).await?;

        let request = xor::frame(command.as_bytes());
        debug!(bytes = request.len(), "sending request");
        net::write_all(&mut stream, &request, self.timeout).await?;

        let mut len_buf = [0u8; xor::LENGTH_PREFIX];
        net::read_exact(&mut stream, &mut len_buf, self.timeout).await?;
        let payload_len = u32::from_be_bytes(len_buf) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(Error::MalformedResponse(format!(
                "response too large: {payload_len} bytes"
            )));
        }

        let mut payload = vec![0u8; payload_len];
        net::read_exact(&mut stream, &mut payload, self.timeout).await?;
        debug!(bytes = payload_len, "received response");

        Ok(xor::decrypt_to_string(&payload))
    }
}

#[async_trait]
impl Transport for LegacyTransport {
    async fn send(&mut self, command: &str) -> Result<String, Error> {
        match self.sysinfo_reply.take() {
            Some(reply) if command == commands::INFO => Ok(reply),
            _ => self.exchange(command).await,
        }
    }

    fn encryption_type(&self) -> EncryptionType {
        EncryptionType::Xor
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }
}
