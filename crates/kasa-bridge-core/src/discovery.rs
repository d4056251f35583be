//! Device discovery.
//!
//! Two probes go out from one UDP socket:
//! - **Legacy (port 9999)**: the XOR-encoded sysinfo query; old firmware
//!   answers with its sysinfo.
//! - **TDP (port 20002)**: a 16-byte header plus a JSON body carrying an
//!   RSA public key; KLAP firmware answers with its encryption scheme.
//!
//! Every reply becomes a candidate address with a protocol hint. Each
//! candidate then gets a full handshake and sysinfo query through the
//! [`DeviceClient`], a bounded number at a time. Failures are collected in
//! the report and logged; they never abort the run.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs8::EncodePublicKey, rand_core::OsRng};
use serde::Deserialize;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::{
    client::{DeviceAddress, DeviceClient},
    commands,
    crypto::xor,
    device::{DeviceInfo, EnergyReading},
    error::Error,
    net,
    response::{self, SysInfo},
    transport::EncryptionType,
};

/// Port for legacy XOR discovery.
pub const LEGACY_DISCOVERY_PORT: u16 = 9999;

/// Port for TDP discovery.
pub const TDP_DISCOVERY_PORT: u16 = 20002;

const TDP_HEADER_LEN: usize = 16;

/// Which probe format to send to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Legacy,
    Tdp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTarget {
    pub addr: SocketAddr,
    pub kind: ProbeKind,
}

impl ProbeTarget {
    pub fn legacy(addr: SocketAddr) -> Self {
        Self {
            addr,
            kind: ProbeKind::Legacy,
        }
    }

    pub fn tdp(addr: SocketAddr) -> Self {
        Self {
            addr,
            kind: ProbeKind::Tdp,
        }
    }
}

/// Discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Where broadcast discovery sends its probes.
    pub probes: Vec<ProbeTarget>,
    /// Candidates queried at the same time.
    pub max_concurrency: usize,
    /// Extra time after the collection window for candidate queries.
    pub update_deadline: Duration,
    /// Ports used when probing a single known IP.
    pub unicast_legacy_port: u16,
    pub unicast_tdp_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let broadcast = IpAddr::V4(Ipv4Addr::BROADCAST);
        Self {
            probes: vec![
                ProbeTarget::legacy(SocketAddr::new(broadcast, LEGACY_DISCOVERY_PORT)),
                ProbeTarget::tdp(SocketAddr::new(broadcast, TDP_DISCOVERY_PORT)),
            ],
            max_concurrency: 20,
            update_deadline: Duration::from_secs(30),
            unicast_legacy_port: LEGACY_DISCOVERY_PORT,
            unicast_tdp_port: TDP_DISCOVERY_PORT,
        }
    }
}

impl DiscoveryConfig {
    pub fn with_probes(mut self, probes: Vec<ProbeTarget>) -> Self {
        self.probes = probes;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_update_deadline(mut self, deadline: Duration) -> Self {
        self.update_deadline = deadline;
        self
    }

    pub fn with_unicast_ports(mut self, legacy: u16, tdp: u16) -> Self {
        self.unicast_legacy_port = legacy;
        self.unicast_tdp_port = tdp;
        self
    }
}

/// A device that could not be queried.
#[derive(Debug, Clone)]
pub struct DeviceFailure {
    pub addr: DeviceAddress,
    pub error: Error,
}

/// Result of a batch operation: successes in input order plus failures.
#[derive(Debug, Clone)]
pub struct BatchReport<T> {
    pub items: Vec<T>,
    pub failures: Vec<DeviceFailure>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            failures: Vec::new(),
        }
    }
}

/// Result of a broadcast discovery run.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub devices: Vec<DeviceInfo>,
    pub failures: Vec<DeviceFailure>,
}

/// A reply turned into something the client can connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub addr: DeviceAddress,
    pub hint: EncryptionType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TdpDiscoveryResult {
    #[serde(default)]
    pub error_code: i32,
    pub result: Option<TdpDeviceInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TdpDeviceInfo {
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    pub device_model: Option<String>,
    pub mac: Option<String>,
    pub mgt_encrypt_schm: Option<TdpEncryptionScheme>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TdpEncryptionScheme {
    pub encrypt_type: Option<String>,
    pub http_port: Option<u16>,
    pub lv: Option<u32>,
    pub new_klap: Option<u8>,
}

/// TDP packet header.
///
/// Layout (16 bytes, big-endian): version u8 = 2, msg_type u8 = 0,
/// op_code u16 = 1 (probe), msg_size u16, flags u8 = 17, padding u8,
/// serial u32, crc32 u32. The CRC is computed over the whole packet with
/// the field first set to `0x5A6B7C8D`.
#[derive(Debug)]
struct TdpHeader {
    msg_size: u16,
    serial: u32,
}

impl TdpHeader {
    const VERSION: u8 = 2;
    const OP_PROBE: u16 = 1;
    const FLAGS: u8 = 17;
    const CRC_SEED: u32 = 0x5A6B_7C8D;

    fn to_bytes(&self) -> [u8; TDP_HEADER_LEN] {
        let mut bytes = [0u8; TDP_HEADER_LEN];
        bytes[0] = Self::VERSION;
        bytes[2..4].copy_from_slice(&Self::OP_PROBE.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.msg_size.to_be_bytes());
        bytes[6] = Self::FLAGS;
        bytes[8..12].copy_from_slice(&self.serial.to_be_bytes());
        bytes[12..16].copy_from_slice(&Self::CRC_SEED.to_be_bytes());
        bytes
    }
}

static TDP_PUBLIC_KEY: OnceLock<String> = OnceLock::new();

fn generate_public_key_pem() -> Result<String, Error> {
    let private_key = RsaPrivateKey::new(&mut OsRng, 2048)
        .map_err(|e| Error::Protocol(format!("RSA key generation failed: {e}")))?;
    RsaPublicKey::from(&private_key)
        .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| Error::Protocol(format!("PEM encoding failed: {e}")))
}

/// PEM of the probe key pair, generated once per process off the runtime.
async fn tdp_public_key() -> Result<String, Error> {
    if let Some(pem) = TDP_PUBLIC_KEY.get() {
        return Ok(pem.clone());
    }
    let pem = tokio::task::spawn_blocking(generate_public_key_pem)
        .await
        .map_err(|e| Error::Protocol(format!("key generation task failed: {e}")))??;
    Ok(TDP_PUBLIC_KEY.get_or_init(|| pem).clone())
}

/// Builds a TDP probe around `public_key_pem`.
pub fn build_tdp_probe(public_key_pem: &str) -> Vec<u8> {
    let payload = serde_json::json!({ "params": { "rsa_key": public_key_pem } }).to_string();
    let header = TdpHeader {
        msg_size: payload.len() as u16,
        serial: rand::random(),
    };

    let mut packet = Vec::with_capacity(TDP_HEADER_LEN + payload.len());
    packet.extend_from_slice(&header.to_bytes());
    packet.extend_from_slice(payload.as_bytes());
    let crc = crc32fast::hash(&packet);
    packet[12..16].copy_from_slice(&crc.to_be_bytes());
    packet
}

/// Parses a TDP reply: 16-byte header, then JSON.
pub fn parse_tdp_response(data: &[u8]) -> Result<TdpDiscoveryResult, Error> {
    if data.len() < TDP_HEADER_LEN {
        return Err(Error::MalformedResponse("TDP reply too short".into()));
    }
    serde_json::from_slice(&data[TDP_HEADER_LEN..])
        .map_err(|e| Error::MalformedResponse(format!("TDP reply: {e}")))
}

/// Turns one UDP reply into a candidate.
///
/// The format is recognized from the content. Legacy replies keep the
/// source port; TDP replies use the advertised `http_port`. A port equal to
/// the client's default for that variant is dropped so the address stays
/// bare.
pub fn candidate_from_reply(
    from: SocketAddr,
    data: &[u8],
    klap_port: u16,
    legacy_port: u16,
) -> Result<Candidate, Error> {
    let bare_unless_default = |port: u16, default: u16| DeviceAddress {
        ip: from.ip(),
        port: (port != default).then_some(port),
    };

    if data.first() == Some(&TdpHeader::VERSION)
        && let Ok(reply) = parse_tdp_response(data)
    {
        if reply.error_code != 0 {
            return Err(Error::DeviceError(format!(
                "TDP reply error_code {}",
                reply.error_code
            )));
        }
        let scheme = reply.result.and_then(|r| r.mgt_encrypt_schm);
        let encrypt_type = scheme.as_ref().and_then(|s| s.encrypt_type.as_deref());
        let http_port = scheme
            .as_ref()
            .and_then(|s| s.http_port)
            .filter(|&p| p > 0)
            .unwrap_or(klap_port);
        return match encrypt_type {
            Some("AES") => Err(Error::UnsupportedDevice(format!(
                "{} uses the AES protocol",
                from.ip()
            ))),
            Some("KLAP") | None => Ok(Candidate {
                addr: bare_unless_default(http_port, klap_port),
                hint: EncryptionType::Klap,
            }),
            Some(_) => Ok(Candidate {
                addr: DeviceAddress::new(from.ip()),
                hint: EncryptionType::Xor,
            }),
        };
    }

    let decoded: serde_json::Value = serde_json::from_slice(&xor::decrypt(data))
        .map_err(|e| Error::MalformedResponse(format!("unrecognized reply: {e}")))?;
    let sysinfo: Option<SysInfo> = response::parse_method(&decoded, "system", "get_sysinfo")?;
    if sysinfo.is_none() {
        return Err(Error::MalformedResponse("legacy reply without sysinfo".into()));
    }
    Ok(Candidate {
        addr: bare_unless_default(from.port(), legacy_port),
        hint: EncryptionType::Xor,
    })
}

/// Discovery engine over a shared [`DeviceClient`].
///
/// ```no_run
/// use std::time::Duration;
/// use kasa_bridge_core::{ClientConfig, DeviceClient, Discoverer, DiscoveryConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let discoverer = Discoverer::new(
///         DeviceClient::new(ClientConfig::default()),
///         DiscoveryConfig::default(),
///     );
///     for device in discoverer.discover(Duration::from_secs(5)).await? {
///         println!("{} {} ({:?})", device.host, device.alias, device.device_type);
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Discoverer {
    client: DeviceClient,
    config: DiscoveryConfig,
}

impl Discoverer {
    pub fn new(client: DeviceClient, config: DiscoveryConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &DeviceClient {
        &self.client
    }

    /// Discovers devices and returns those that answered a sysinfo query.
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<DeviceInfo>, Error> {
        Ok(self.discover_with_report(timeout).await?.devices)
    }

    /// Like [`discover`](Self::discover), also returning per-device failures.
    ///
    /// Only failing to open the probe socket is an error.
    pub async fn discover_with_report(&self, timeout: Duration) -> Result<DiscoveryReport, Error> {
        let started = Instant::now();
        let probes = self.build_probes(&self.config.probes).await?;
        let replies = net::broadcast(&probes, timeout, None).await?;

        let mut report = DiscoveryReport::default();
        let mut candidates: Vec<Candidate> = Vec::new();
        for (from, data) in replies {
            match candidate_from_reply(
                from,
                &data,
                self.client.config().klap_port,
                self.client.config().legacy_port,
            ) {
                Ok(candidate) => {
                    if !candidates.iter().any(|c| c.addr == candidate.addr) {
                        debug!(addr = %candidate.addr, hint = %candidate.hint, "candidate");
                        candidates.push(candidate);
                    }
                }
                Err(e @ (Error::UnsupportedDevice(_) | Error::DeviceError(_))) => {
                    warn!(%from, error = %e, "skipping device");
                    report.failures.push(DeviceFailure {
                        addr: DeviceAddress::new(from.ip()),
                        error: e,
                    });
                }
                Err(e) => debug!(%from, error = %e, "ignoring unrecognized reply"),
            }
        }

        let deadline = started + timeout + self.config.update_deadline;
        let mut pending: HashSet<DeviceAddress> = candidates.iter().map(|c| c.addr).collect();
        let client = &self.client;
        let results: Vec<(DeviceAddress, Result<DeviceInfo, Error>)> = stream::iter(candidates)
            .map(|candidate| async move {
                client.set_hint(&candidate.addr, candidate.hint).await;
                let result = client.update(&candidate.addr).await;
                (candidate.addr, result)
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .take_until(sleep_until(deadline))
            .collect()
            .await;

        let mut seen = HashSet::new();
        for (addr, result) in results {
            pending.remove(&addr);
            match result {
                Ok(device) => {
                    if seen.insert(device.device_id.clone()) {
                        report.devices.push(device);
                    } else {
                        debug!(%addr, device_id = %device.device_id, "duplicate device");
                    }
                }
                Err(error) => {
                    warn!(%addr, %error, "device query failed");
                    report.failures.push(DeviceFailure { addr, error });
                }
            }
        }
        for addr in pending {
            warn!(%addr, "abandoned at discovery deadline");
            report.failures.push(DeviceFailure {
                addr,
                error: Error::Timeout(format!("{addr}: discovery deadline passed")),
            });
        }

        info!(
            devices = report.devices.len(),
            failures = report.failures.len(),
            "discovery finished"
        );
        Ok(report)
    }

    /// Queries one known address.
    ///
    /// A bare IP is probed first so the right variant is tried first. An
    /// endpoint that never answers fails with [`Error::Unreachable`].
    pub async fn discover_single(
        &self,
        addr: &DeviceAddress,
        timeout: Duration,
    ) -> Result<DeviceInfo, Error> {
        let addr = self.resolve(addr, timeout).await;
        self.client.update(&addr).await
    }

    /// Energy reading of one known address; `Ok(None)` when it has no meter.
    pub async fn energy_single(
        &self,
        addr: &DeviceAddress,
        timeout: Duration,
    ) -> Result<Option<EnergyReading>, Error> {
        let addr = self.resolve(addr, timeout).await;
        self.client.energy(&addr).await
    }

    /// [`discover_single`](Self::discover_single) over many addresses.
    pub async fn update_hosts(
        &self,
        addrs: &[DeviceAddress],
        timeout: Duration,
    ) -> BatchReport<DeviceInfo> {
        let results = stream::iter(addrs.iter().copied())
            .map(|addr| async move {
                (addr, self.discover_single(&addr, timeout).await.map(Some))
            })
            .buffered(self.config.max_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        collect_batch(results)
    }

    /// [`energy_single`](Self::energy_single) over many addresses. Devices
    /// without a meter are left out.
    pub async fn energy_hosts(
        &self,
        addrs: &[DeviceAddress],
        timeout: Duration,
    ) -> BatchReport<EnergyReading> {
        let results = stream::iter(addrs.iter().copied())
            .map(|addr| async move { (addr, self.energy_single(&addr, timeout).await) })
            .buffered(self.config.max_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        collect_batch(results)
    }

    /// For a bare IP, sends unicast probes and adopts the first answer's
    /// hint and port. Anything else is returned unchanged.
    async fn resolve(&self, addr: &DeviceAddress, timeout: Duration) -> DeviceAddress {
        if addr.port.is_some() {
            return *addr;
        }
        let targets = [
            ProbeTarget::legacy(SocketAddr::new(addr.ip, self.config.unicast_legacy_port)),
            ProbeTarget::tdp(SocketAddr::new(addr.ip, self.config.unicast_tdp_port)),
        ];
        let replies = match self.build_probes(&targets).await {
            Ok(probes) => net::broadcast(&probes, timeout, Some(1)).await,
            Err(e) => Err(e),
        };
        let replies = match replies {
            Ok(replies) => replies,
            Err(e) => {
                debug!(%addr, error = %e, "unicast probe failed, negotiating by trial");
                return *addr;
            }
        };

        let config = self.client.config();
        for (from, data) in replies {
            if from.ip() != addr.ip {
                continue;
            }
            if let Ok(candidate) =
                candidate_from_reply(from, &data, config.klap_port, config.legacy_port)
            {
                debug!(addr = %candidate.addr, hint = %candidate.hint, "probe answered");
                self.client.set_hint(&candidate.addr, candidate.hint).await;
                return candidate.addr;
            }
        }
        debug!(%addr, "no probe answer, negotiating by trial");
        *addr
    }

    async fn build_probes(&self, targets: &[ProbeTarget]) -> Result<Vec<(SocketAddr, Vec<u8>)>, Error> {
        let mut probes = Vec::with_capacity(targets.len());
        for target in targets {
            let payload = match target.kind {
                ProbeKind::Legacy => xor::encrypt(commands::INFO.as_bytes()),
                ProbeKind::Tdp => build_tdp_probe(&tdp_public_key().await?),
            };
            probes.push((target.addr, payload));
        }
        Ok(probes)
    }
}

fn collect_batch<T>(results: Vec<(DeviceAddress, Result<Option<T>, Error>)>) -> BatchReport<T> {
    let mut report = BatchReport::default();
    for (addr, result) in results {
        match result {
            Ok(Some(item)) => report.items.push(item),
            Ok(None) => {
                debug!(%addr, "no energy meter");
            }
            Err(error) => {
                warn!(%addr, %error, "device query failed");
                report.failures.push(DeviceFailure { addr, error });
            }
        }
    }
    report
}
