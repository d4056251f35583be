//! Socket primitives shared by the transports and discovery.
//!
//! Every TCP step is bounded by the caller's per-round-trip timeout and
//! reports expiry as [`Error::Timeout`]. UDP collection treats silence as
//! absence of data: [`broadcast`] returns whatever arrived in the window.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::error::Error;

/// Largest datagram a device is expected to send back.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Sends every probe from one socket and collects replies until `collect`
/// elapses or `max_replies` datagrams have arrived.
///
/// Only failing to open the socket is an error. A probe that cannot be sent
/// is logged and skipped.
pub async fn broadcast(
    probes: &[(SocketAddr, Vec<u8>)],
    collect: Duration,
    max_replies: Option<usize>,
) -> Result<Vec<(SocketAddr, Vec<u8>)>, Error> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;

    for (target, payload) in probes {
        match socket.send_to(payload, target).await {
            Ok(_) => debug!(%target, bytes = payload.len(), "sent probe"),
            Err(e) => warn!(%target, error = %e, "failed to send probe"),
        }
    }

    let deadline = Instant::now() + collect;
    let mut replies = Vec::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        if max_replies.is_some_and(|max| replies.len() >= max) {
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                debug!(%from, bytes = n, "received reply");
                replies.push((from, buf[..n].to_vec()));
            }
            // ICMP unreachable from a unicast probe surfaces here on some platforms.
            Ok(Err(e)) => debug!(error = %e, "recv failed"),
            Err(_) => break,
        }
    }

    debug!(replies = replies.len(), "collection window closed");
    Ok(replies)
}

/// Opens a TCP connection within `io_timeout`.
pub async fn connect(addr: SocketAddr, io_timeout: Duration) -> Result<TcpStream, Error> {
    timeout(io_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout(format!("connect to {addr} timed out")))?
        .map_err(|e| Error::ConnectionFailed(format!("{addr}: {e}")))
}

pub async fn write_all(
    stream: &mut TcpStream,
    bytes: &[u8],
    io_timeout: Duration,
) -> Result<(), Error> {
    timeout(io_timeout, stream.write_all(bytes))
        .await
        .map_err(|_| Error::Timeout("write timed out".into()))?
        .map_err(Error::from)
}

pub async fn read_exact(
    stream: &mut TcpStream,
    buf: &mut [u8],
    io_timeout: Duration,
) -> Result<(), Error> {
    timeout(io_timeout, stream.read_exact(buf))
        .await
        .map_err(|_| Error::Timeout("read timed out".into()))?
        .map(|_| ())
        .map_err(Error::from)
}

/// Reads whatever is available; `Ok(0)` means the peer closed.
pub async fn read_some(
    stream: &mut TcpStream,
    buf: &mut [u8],
    io_timeout: Duration,
) -> Result<usize, Error> {
    timeout(io_timeout, stream.read(buf))
        .await
        .map_err(|_| Error::Timeout("read timed out".into()))?
        .map_err(Error::from)
}
