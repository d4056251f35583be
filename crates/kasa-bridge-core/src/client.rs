//! Device protocol client.
//!
//! [`DeviceClient`] owns one session per [`DeviceAddress`]. A session
//! remembers which protocol variant worked and keeps its transport (and, for
//! KLAP, the established keys) between calls. Every operation locks the
//! session for its whole duration, so concurrent callers against the same
//! device queue behind each other and never race a second handshake.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    Credentials, commands,
    device::{DeviceInfo, DeviceType, EnergyReading},
    error::Error,
    response::{self, DayStat, MonthStat, RealtimeReading},
    transport::{self, DeviceConfig, EncryptionType, Transport},
};

/// Network endpoint of a device.
///
/// Without a port, each protocol variant uses its configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

impl DeviceAddress {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip, port: None }
    }

    pub fn with_port(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port: Some(port),
        }
    }
}

impl From<IpAddr> for DeviceAddress {
    fn from(ip: IpAddr) -> Self {
        Self::new(ip)
    }
}

impl From<SocketAddr> for DeviceAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::with_port(addr.ip(), addr.port())
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    /// Parses `a.b.c.d`, `a.b.c.d:port`, `::1` or `[::1]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        s.parse::<IpAddr>()
            .map(Self::new)
            .map_err(|_| Error::InvalidAddress(s.to_string()))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}", SocketAddr::new(self.ip, port)),
            None => write!(f, "{}", self.ip),
        }
    }
}

/// Settings threaded into [`DeviceClient::new`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub credentials: Option<Credentials>,
    /// Bound on each network round trip.
    pub timeout: Duration,
    /// Extra attempts after a transient failure.
    pub retries: u32,
    /// First backoff delay; doubles on every further attempt.
    pub retry_backoff: Duration,
    pub klap_port: u16,
    pub legacy_port: u16,
    pub session_refresh_margin: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            timeout: transport::DEFAULT_TIMEOUT,
            retries: 2,
            retry_backoff: Duration::from_millis(250),
            klap_port: transport::klap::DEFAULT_PORT,
            legacy_port: transport::legacy::DEFAULT_PORT,
            session_refresh_margin: transport::klap::DEFAULT_REFRESH_MARGIN,
        }
    }
}

impl ClientConfig {
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_ports(mut self, klap_port: u16, legacy_port: u16) -> Self {
        self.klap_port = klap_port;
        self.legacy_port = legacy_port;
        self
    }

    pub fn with_session_refresh_margin(mut self, margin: Duration) -> Self {
        self.session_refresh_margin = margin;
        self
    }
}

#[derive(Default)]
struct DeviceSession {
    hint: Option<EncryptionType>,
    transport: Option<Box<dyn Transport>>,
    last_handshake: Option<Instant>,
}

impl DeviceSession {
    fn invalidate(&mut self) {
        self.transport = None;
    }
}

/// Client for Kasa devices on the local network.
///
/// Cloning is cheap and clones share sessions.
///
/// ```no_run
/// use kasa_bridge_core::{ClientConfig, DeviceClient};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = DeviceClient::new(ClientConfig::default());
///     let info = client.update(&"192.168.1.100".parse()?).await?;
///     println!("{} is {}", info.alias, if info.is_on { "on" } else { "off" });
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct DeviceClient {
    config: Arc<ClientConfig>,
    sessions: Arc<DashMap<DeviceAddress, Arc<Mutex<DeviceSession>>>>,
}

impl DeviceClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn session(&self, addr: &DeviceAddress) -> Arc<Mutex<DeviceSession>> {
        self.sessions
            .entry(*addr)
            .or_insert_with(|| Arc::new(Mutex::new(DeviceSession::default())))
            .value()
            .clone()
    }

    /// Records which variant to try first for `addr`, e.g. from discovery.
    pub async fn set_hint(&self, addr: &DeviceAddress, hint: EncryptionType) {
        let session = self.session(addr);
        let mut session = session.lock().await;
        if session.transport.is_none() {
            session.hint = Some(hint);
        }
    }

    /// Variant the session for `addr` settled on, if any.
    pub async fn session_variant(&self, addr: &DeviceAddress) -> Option<EncryptionType> {
        let session = self.sessions.get(addr)?.value().clone();
        let session = session.lock().await;
        session.transport.as_ref().map(|t| t.encryption_type())
    }

    /// When the session for `addr` last completed protocol negotiation.
    pub async fn last_handshake(&self, addr: &DeviceAddress) -> Option<Instant> {
        let session = self.sessions.get(addr)?.value().clone();
        let session = session.lock().await;
        session.last_handshake
    }

    /// Resets the session for `addr` so the next call negotiates from scratch.
    ///
    /// The entry stays in the map; callers already holding it see the reset.
    pub async fn forget(&self, addr: &DeviceAddress) {
        let Some(session) = self.sessions.get(addr).map(|s| s.value().clone()) else {
            return;
        };
        let mut session = session.lock().await;
        session.invalidate();
        session.hint = None;
        session.last_handshake = None;
    }

    /// Sends a raw JSON command and returns the raw reply text.
    pub async fn query(&self, addr: &DeviceAddress, command: &str) -> Result<String, Error> {
        let session = self.session(addr);
        let mut session = session.lock().await;
        self.exchange(&mut session, addr, command).await
    }

    /// Sends a command and parses the reply as JSON.
    ///
    /// A reply that cannot be decrypted or parsed drops the session and is
    /// retried once; a second bad reply is reported as
    /// [`Error::UnsupportedDevice`].
    pub async fn query_json(&self, addr: &DeviceAddress, command: &str) -> Result<Value, Error> {
        let session = self.session(addr);
        let mut session = session.lock().await;
        self.exchange_json(&mut session, addr, command).await
    }

    /// Queries sysinfo and normalizes it.
    pub async fn update(&self, addr: &DeviceAddress) -> Result<DeviceInfo, Error> {
        let session = self.session(addr);
        let mut session = session.lock().await;
        let raw = self.exchange_json(&mut session, addr, commands::INFO).await?;
        DeviceInfo::from_sysinfo_response(&raw, &addr.ip.to_string())
    }

    /// Reads energy data, or `None` when the device has no meter.
    ///
    /// Strips report the sum over their outlets (voltage averaged).
    pub async fn energy(&self, addr: &DeviceAddress) -> Result<Option<EnergyReading>, Error> {
        let session = self.session(addr);
        let mut session = session.lock().await;

        let raw = self.exchange_json(&mut session, addr, commands::INFO).await?;
        let host = addr.ip.to_string();
        let info = DeviceInfo::from_sysinfo_response(&raw, &host)?;
        if !info.has_energy_monitoring {
            debug!(%addr, "device has no energy meter");
            return Ok(None);
        }

        let module = if info.device_type.is_bulb() {
            commands::BULB_EMETER
        } else {
            commands::EMETER
        };

        let mut reading = EnergyReading {
            device_id: info.device_id.clone(),
            alias: info.alias.clone(),
            ..EnergyReading::default()
        };

        let child_ids: Vec<String> = match (&info.device_type, &info.children) {
            (DeviceType::PowerStrip, Some(children)) => {
                children.iter().map(|c| c.id.clone()).collect()
            }
            _ => Vec::new(),
        };

        if child_ids.is_empty() {
            let meter = self.read_meter(&mut session, addr, module, None).await?;
            reading.current_power = meter.power;
            reading.voltage = meter.voltage.unwrap_or(0.0);
            reading.current = meter.current;
            reading.total_energy = meter.total;
            reading.today_energy = meter.today;
            reading.month_energy = meter.month;
        } else {
            let mut voltages = Vec::new();
            for child in &child_ids {
                let meter = self
                    .read_meter(&mut session, addr, module, Some(child))
                    .await?;
                reading.current_power += meter.power;
                reading.current += meter.current;
                reading.total_energy += meter.total;
                reading.today_energy += meter.today;
                reading.month_energy += meter.month;
                voltages.extend(meter.voltage);
            }
            if !voltages.is_empty() {
                reading.voltage = voltages.iter().sum::<f64>() / voltages.len() as f64;
            }
        }

        Ok(Some(reading))
    }

    /// Switches a device, or one strip outlet, on or off.
    pub async fn set_power(
        &self,
        addr: &DeviceAddress,
        on: bool,
        child: Option<&str>,
    ) -> Result<(), Error> {
        let session = self.session(addr);
        let mut session = session.lock().await;

        let (command, module, method) = match child {
            Some(id) => (commands::relay_for_child(id, on), "system", "set_relay_state"),
            None => {
                let raw = self.exchange_json(&mut session, addr, commands::INFO).await?;
                let info = DeviceInfo::from_sysinfo_response(&raw, &addr.ip.to_string())?;
                if info.device_type.is_bulb() {
                    (
                        commands::light_power(on),
                        commands::LIGHTING_SERVICE,
                        "transition_light_state",
                    )
                } else {
                    let relay = if on {
                        commands::RELAY_ON
                    } else {
                        commands::RELAY_OFF
                    };
                    (relay.to_string(), "system", "set_relay_state")
                }
            }
        };

        let reply = self.exchange_json(&mut session, addr, &command).await?;
        response::method_result(&reply, module, method)?;
        debug!(%addr, on, ?child, "power state set");
        Ok(())
    }

    async fn read_meter(
        &self,
        session: &mut DeviceSession,
        addr: &DeviceAddress,
        module: &str,
        child: Option<&str>,
    ) -> Result<MeterValues, Error> {
        let wrap = |command: Value| match child {
            Some(id) => commands::with_child_context(id, command).to_string(),
            None => command.to_string(),
        };

        let raw = self
            .exchange_json(session, addr, &wrap(commands::realtime(module)))
            .await?;
        let realtime: RealtimeReading = response::parse_method(&raw, module, "get_realtime")?
            .ok_or_else(|| Error::UnsupportedDevice(format!("{addr}: no {module}.get_realtime")))?;

        let today = Local::now().date_naive();
        let (year, month, day) = (today.year(), today.month(), today.day());

        let day_energy = match self
            .exchange_json(session, addr, &wrap(commands::daystat(module, year, month)))
            .await
            .and_then(|raw| response::parse_method::<DayStat>(&raw, module, "get_daystat"))
        {
            Ok(stat) => stat.and_then(|s| s.energy_on(year, month, day)),
            Err(Error::DeviceError(e)) => {
                debug!(%addr, error = %e, "daily statistics unavailable");
                None
            }
            Err(e) => return Err(e),
        };

        let month_energy = match self
            .exchange_json(session, addr, &wrap(commands::monthstat(module, year)))
            .await
            .and_then(|raw| response::parse_method::<MonthStat>(&raw, module, "get_monthstat"))
        {
            Ok(stat) => stat.and_then(|s| s.energy_in(year, month)),
            Err(Error::DeviceError(e)) => {
                debug!(%addr, error = %e, "monthly statistics unavailable");
                None
            }
            Err(e) => return Err(e),
        };

        Ok(MeterValues {
            power: realtime.power_w().unwrap_or(0.0),
            voltage: realtime.voltage_v(),
            current: realtime.current_a().unwrap_or(0.0),
            total: realtime.total_kwh().unwrap_or(0.0),
            today: day_energy.unwrap_or(0.0),
            month: month_energy.unwrap_or(0.0),
        })
    }

    async fn exchange_json(
        &self,
        session: &mut DeviceSession,
        addr: &DeviceAddress,
        command: &str,
    ) -> Result<Value, Error> {
        let mut last = String::new();
        for attempt in 0..2 {
            let outcome = self
                .exchange(session, addr, command)
                .await
                .and_then(|text| {
                    serde_json::from_str::<Value>(&text)
                        .map_err(|e| Error::MalformedResponse(format!("invalid JSON: {e}")))
                });
            match outcome {
                Err(Error::MalformedResponse(reason)) => {
                    warn!(%addr, attempt, %reason, "malformed response, resetting session");
                    session.invalidate();
                    last = reason;
                }
                other => return other,
            }
        }
        Err(Error::UnsupportedDevice(format!("{addr}: {last}")))
    }

    /// One command with the transient-failure retry policy applied.
    async fn exchange(
        &self,
        session: &mut DeviceSession,
        addr: &DeviceAddress,
        command: &str,
    ) -> Result<String, Error> {
        let mut attempt = 0;
        loop {
            match self.send_once(session, addr, command).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() && attempt < self.config.retries => {
                    let delay = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    debug!(%addr, attempt, error = %e, ?delay, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(Error::Unreachable(format!(
                        "{addr}: {e} after {} attempts",
                        attempt + 1
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        session: &mut DeviceSession,
        addr: &DeviceAddress,
        command: &str,
    ) -> Result<String, Error> {
        if session.transport.is_none() {
            let config = self.device_config(addr, session.hint);
            let transport = transport::connect(&config).await?;
            debug!(%addr, variant = %transport.encryption_type(), "session negotiated");
            session.hint = Some(transport.encryption_type());
            session.last_handshake = Some(Instant::now());
            session.transport = Some(transport);
        }
        let transport = session
            .transport
            .as_mut()
            .ok_or_else(|| Error::ConnectionFailed(format!("{addr}: no transport")))?;
        transport.send(command).await
    }

    fn device_config(&self, addr: &DeviceAddress, hint: Option<EncryptionType>) -> DeviceConfig {
        let mut config = DeviceConfig::new(addr.ip)
            .with_port(addr.port)
            .with_credentials(self.config.credentials.clone())
            .with_timeout(self.config.timeout)
            .with_encryption_hint(hint);
        config.klap_port = self.config.klap_port;
        config.legacy_port = self.config.legacy_port;
        config.session_refresh_margin = self.config.session_refresh_margin;
        config
    }
}

impl fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClient")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

struct MeterValues {
    power: f64,
    voltage: Option<f64>,
    current: f64,
    total: f64,
    today: f64,
    month: f64,
}
