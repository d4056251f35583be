//! KLAP transport for newer Kasa firmware.
//!
//! KLAP runs over plain HTTP on port 80:
//!
//! 1. **Handshake 1**: the client posts 16 random bytes, the device answers
//!    with its own 16-byte seed and a hash binding both seeds to an auth hash.
//!    The client finds which credential set produced that hash.
//! 2. **Handshake 2**: the client proves it knows the same auth hash. The
//!    device keeps the `TP_SESSIONID` cookie from handshake 1 alive.
//! 3. **Request**: every command is encrypted and signed under a fresh
//!    sequence number and posted to `/app/request?seq=N`.
//!
//! Requests are written on raw TCP because the devices reject lowercase
//! header names, which general-purpose HTTP clients produce.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    Credentials,
    crypto::klap::{
        KlapEncryptionSession, SEED_LEN, generate_auth_hash, generate_auth_hash_v2,
        handshake1_seed_auth_hash, handshake1_seed_auth_hash_v2, handshake2_seed_auth_hash,
        handshake2_seed_auth_hash_v2,
    },
    error::Error,
    net,
    transport::{EncryptionType, Transport},
};

/// Default HTTP port for KLAP.
pub const DEFAULT_PORT: u16 = 80;

/// Session lifetime assumed when the device omits `TIMEOUT` from its cookie.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(86_400);

/// How long before the device's own expiry the client re-handshakes.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(20 * 60);

const SESSION_COOKIE_NAME: &str = "TP_SESSIONID";

/// Lifecycle of a KLAP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlapState {
    Unauthenticated,
    Handshake1Sent,
    Handshake2Sent,
    Established,
    /// The session outlived its expiry clock or the device answered 403.
    Expired,
    /// Handshake rejected, response failed verification, or the exchange broke.
    Failed,
}

#[derive(Clone)]
enum AuthHash {
    V1([u8; 16]),
    V2([u8; 32]),
}

impl AuthHash {
    fn as_bytes(&self) -> &[u8] {
        match self {
            AuthHash::V1(h) => h.as_slice(),
            AuthHash::V2(h) => h.as_slice(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum HandshakeVersion {
    V1,
    V2,
}

struct Session {
    cipher: KlapEncryptionSession,
    cookie: Option<String>,
    expires_at: Instant,
}

/// Transport using KLAP over HTTP.
///
/// The transport owns at most one session and re-handshakes on its own when
/// that session expires or the device stops accepting it.
///
/// ```no_run
/// use kasa_bridge_core::{Credentials, transport::{KlapTransport, Transport}};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let credentials = Credentials::new("user@example.com", "password");
///     let mut transport = KlapTransport::connect(
///         "192.168.1.100:80".parse()?,
///         Some(credentials),
///         Duration::from_secs(10),
///     )
///     .await?;
///
///     let response = transport.send(r#"{"system":{"get_sysinfo":{}}}"#).await?;
///     println!("{}", response);
///     Ok(())
/// }
/// ```
pub struct KlapTransport {
    addr: SocketAddr,
    credentials: Option<Credentials>,
    timeout: Duration,
    refresh_margin: Duration,
    state: KlapState,
    session: Option<Session>,
}

impl KlapTransport {
    /// Creates an unauthenticated transport. The first [`send`](Transport::send)
    /// performs the handshake.
    pub fn new(addr: SocketAddr, credentials: Option<Credentials>, timeout: Duration) -> Self {
        Self {
            addr,
            credentials,
            timeout,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            state: KlapState::Unauthenticated,
            session: None,
        }
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Creates a transport and completes the handshake.
    pub async fn connect(
        addr: SocketAddr,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let mut transport = Self::new(addr, credentials, timeout);
        transport.handshake().await?;
        Ok(transport)
    }

    pub fn state(&self) -> KlapState {
        self.state
    }

    /// When the current session stops being used, if one is established.
    pub fn expires_at(&self) -> Option<Instant> {
        self.session.as_ref().map(|s| s.expires_at)
    }

    /// Marks the session expired; the next send re-handshakes.
    pub fn expire(&mut self) {
        if self.state == KlapState::Established {
            self.state = KlapState::Expired;
        }
    }

    /// Runs both handshake steps from scratch, replacing any session.
    pub async fn handshake(&mut self) -> Result<(), Error> {
        self.session = None;
        self.state = KlapState::Unauthenticated;
        match self.run_handshake().await {
            Ok(session) => {
                self.session = Some(session);
                self.state = KlapState::Established;
                debug!(addr = %self.addr, "KLAP session established");
                Ok(())
            }
            Err(e) => {
                self.state = KlapState::Failed;
                Err(e)
            }
        }
    }

    async fn run_handshake(&mut self) -> Result<Session, Error> {
        let mut local_seed = [0u8; SEED_LEN];
        rand::rng().fill_bytes(&mut local_seed);
        let started = Instant::now();

        self.state = KlapState::Handshake1Sent;
        let (remote_seed, server_hash, cookie) = self.handshake1(&local_seed).await?;

        let (auth_hash, version) = self
            .match_server_hash(&local_seed, &remote_seed, &server_hash)
            .ok_or_else(|| {
                debug!(
                    server_hash = %hex::encode(server_hash),
                    "no credential combination matched"
                );
                Error::AuthenticationFailed(format!(
                    "{}: device hash did not match any credentials",
                    self.addr
                ))
            })?;

        let payload = match version {
            HandshakeVersion::V1 => handshake2_seed_auth_hash(&remote_seed, auth_hash.as_bytes()),
            HandshakeVersion::V2 => {
                handshake2_seed_auth_hash_v2(&local_seed, &remote_seed, auth_hash.as_bytes())
            }
        };

        self.state = KlapState::Handshake2Sent;
        let response = http_post(
            self.addr,
            "/app/handshake2",
            &payload,
            cookie.as_ref().map(|c| c.id.as_str()),
            self.timeout,
        )
        .await?;
        if response.status != 200 {
            return Err(Error::AuthenticationFailed(format!(
                "handshake2 returned status {}",
                response.status
            )));
        }

        let lifetime = cookie
            .as_ref()
            .and_then(|c| c.timeout)
            .unwrap_or(DEFAULT_SESSION_TIMEOUT);
        debug!(
            addr = %self.addr,
            version = ?version,
            lifetime_secs = lifetime.as_secs(),
            "handshake2 accepted"
        );

        Ok(Session {
            cipher: KlapEncryptionSession::new(&local_seed, &remote_seed, auth_hash.as_bytes()),
            cookie: cookie.map(|c| c.id),
            expires_at: started + lifetime.saturating_sub(self.refresh_margin),
        })
    }

    async fn handshake1(
        &self,
        local_seed: &[u8; SEED_LEN],
    ) -> Result<([u8; SEED_LEN], [u8; 32], Option<SessionCookie>), Error> {
        debug!(addr = %self.addr, local_seed = %hex::encode(local_seed), "sending handshake1");

        let response =
            http_post(self.addr, "/app/handshake1", local_seed, None, self.timeout).await?;
        if response.status != 200 {
            return Err(Error::Protocol(format!(
                "handshake1 returned status {}",
                response.status
            )));
        }
        if response.body.len() != SEED_LEN + 32 {
            return Err(Error::Protocol(format!(
                "handshake1 response has {} bytes, expected 48",
                response.body.len()
            )));
        }

        let mut remote_seed = [0u8; SEED_LEN];
        let mut server_hash = [0u8; 32];
        remote_seed.copy_from_slice(&response.body[..SEED_LEN]);
        server_hash.copy_from_slice(&response.body[SEED_LEN..]);
        debug!(remote_seed = %hex::encode(remote_seed), "handshake1 answered");

        Ok((remote_seed, server_hash, response.cookie))
    }

    /// Checks each credential set as v2+v2, v2+v1, then v1+v1.
    fn match_server_hash(
        &self,
        local_seed: &[u8],
        remote_seed: &[u8],
        server_hash: &[u8; 32],
    ) -> Option<(AuthHash, HandshakeVersion)> {
        for (label, creds) in Credentials::candidates(self.credentials.as_ref()) {
            let v2 = AuthHash::V2(generate_auth_hash_v2(&creds));
            if handshake1_seed_auth_hash_v2(local_seed, remote_seed, v2.as_bytes()) == *server_hash
            {
                debug!(credentials = label, "matched v2 auth, v2 handshake");
                return Some((v2, HandshakeVersion::V2));
            }
            if handshake1_seed_auth_hash(local_seed, v2.as_bytes()) == *server_hash {
                debug!(credentials = label, "matched v2 auth, v1 handshake");
                return Some((v2, HandshakeVersion::V1));
            }
            let v1 = AuthHash::V1(generate_auth_hash(&creds));
            if handshake1_seed_auth_hash(local_seed, v1.as_bytes()) == *server_hash {
                debug!(credentials = label, "matched v1 auth, v1 handshake");
                return Some((v1, HandshakeVersion::V1));
            }
        }
        None
    }

    async fn request(&mut self, command: &str) -> Result<String, Error> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::SessionExpired("no session".into()))?;
        let (body, seq) = session.cipher.encrypt(command.as_bytes());
        let cookie = session.cookie.clone();

        debug!(addr = %self.addr, seq, "sending KLAP request");
        let path = format!("/app/request?seq={seq}");
        let response = match http_post(self.addr, &path, &body, cookie.as_deref(), self.timeout)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.state = KlapState::Failed;
                return Err(e);
            }
        };

        match response.status {
            200 => {}
            403 => {
                self.state = KlapState::Expired;
                return Err(Error::SessionExpired(format!("{} rejected seq {seq}", self.addr)));
            }
            status => {
                self.state = KlapState::Failed;
                return Err(Error::Protocol(format!("request returned status {status}")));
            }
        }

        let Some(session) = self.session.as_mut() else {
            return Err(Error::SessionExpired("session dropped mid-request".into()));
        };
        let plain = match session.cipher.decrypt(&response.body, seq) {
            Ok(plain) => plain,
            Err(e) => {
                self.state = KlapState::Failed;
                return Err(Error::MalformedResponse(format!("seq {seq}: {e}")));
            }
        };

        String::from_utf8(plain).map_err(|e| {
            self.state = KlapState::Failed;
            Error::MalformedResponse(format!("response is not UTF-8: {e}"))
        })
    }
}

#[async_trait]
impl Transport for KlapTransport {
    async fn send(&mut self, command: &str) -> Result<String, Error> {
        if self.state == KlapState::Established
            && self.expires_at().is_some_and(|at| Instant::now() >= at)
        {
            debug!(addr = %self.addr, "session past its expiry, refreshing");
            self.state = KlapState::Expired;
        }
        if self.state != KlapState::Established {
            self.handshake().await?;
        }

        match self.request(command).await {
            Err(Error::SessionExpired(reason)) => {
                debug!(addr = %self.addr, %reason, "session rejected, re-handshaking once");
                self.handshake().await?;
                self.request(command).await
            }
            other => other,
        }
    }

    fn encryption_type(&self) -> EncryptionType {
        EncryptionType::Klap
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl fmt::Debug for KlapTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KlapTransport")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionCookie {
    id: String,
    timeout: Option<Duration>,
}

#[derive(Debug)]
struct HttpResponse {
    status: u16,
    body: Vec<u8>,
    cookie: Option<SessionCookie>,
}

/// Posts `body` with title-case headers and reads a `Content-Length` framed
/// reply (or until close when the header is missing).
async fn http_post(
    addr: SocketAddr,
    path: &str,
    body: &[u8],
    cookie: Option<&str>,
    io_timeout: Duration,
) -> Result<HttpResponse, Error> {
    let mut request = format!(
        "POST {path} HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Content-Type: application/octet-stream\r\n\
         Content-Length: {}\r\n\
         Accept: */*\r\n",
        body.len()
    );
    if let Some(cookie) = cookie {
        request.push_str(&format!("Cookie: {SESSION_COOKIE_NAME}={cookie}\r\n"));
    }
    request.push_str("\r\n");

    let mut stream = net::connect(addr, io_timeout).await?;
    let mut bytes = request.into_bytes();
    bytes.extend_from_slice(body);
    net::write_all(&mut stream, &bytes, io_timeout).await?;

    let mut response = Vec::with_capacity(1024);
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = net::read_some(&mut stream, &mut buf, io_timeout).await?;
        if n == 0 {
            return Err(Error::Protocol("connection closed before HTTP headers".into()));
        }
        response.extend_from_slice(&buf[..n]);
        if let Some(end) = find_header_end(&response) {
            break end;
        }
    };

    let headers = String::from_utf8_lossy(&response[..header_end]).into_owned();
    let status = parse_status_code(&headers)
        .ok_or_else(|| Error::Protocol("invalid HTTP status line".into()))?;
    let body_start = header_end + 4;

    match parse_content_length(&headers) {
        Some(expected) => {
            while response.len() - body_start < expected {
                let n = net::read_some(&mut stream, &mut buf, io_timeout).await?;
                if n == 0 {
                    return Err(Error::Protocol("connection closed mid-body".into()));
                }
                response.extend_from_slice(&buf[..n]);
            }
            response.truncate(body_start + expected);
        }
        None => loop {
            let n = net::read_some(&mut stream, &mut buf, io_timeout).await?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
        },
    }

    Ok(HttpResponse {
        status,
        body: response.split_off(body_start),
        cookie: parse_session_cookie(&headers),
    })
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_code(headers: &str) -> Option<u16> {
    headers.lines().next()?.split_whitespace().nth(1)?.parse().ok()
}

fn header_value<'a>(headers: &'a str, name: &str) -> impl Iterator<Item = &'a str> + use<'a> {
    let name = name.to_ascii_lowercase();
    headers.lines().filter_map(move |line| {
        let (key, value) = line.split_once(':')?;
        (key.trim().to_ascii_lowercase() == name).then_some(value.trim())
    })
}

fn parse_content_length(headers: &str) -> Option<usize> {
    header_value(headers, "content-length").next()?.parse().ok()
}

/// Parses `Set-Cookie: TP_SESSIONID=<id>;TIMEOUT=<secs>`.
fn parse_session_cookie(headers: &str) -> Option<SessionCookie> {
    header_value(headers, "set-cookie").find_map(|value| {
        let mut id = None;
        let mut timeout = None;
        for attr in value.split(';') {
            let Some((key, val)) = attr.trim().split_once('=') else {
                continue;
            };
            match key {
                SESSION_COOKIE_NAME => id = Some(val.to_string()),
                k if k.eq_ignore_ascii_case("timeout") => {
                    timeout = val.parse().ok().map(Duration::from_secs);
                }
                _ => {}
            }
        }
        id.map(|id| SessionCookie { id, timeout })
    })
}
