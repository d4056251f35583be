//! Simulated Kasa devices on 127.0.0.1.
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::Datelike;
use kasa_bridge_core::{
    ClientConfig, Credentials, DeviceAddress, DeviceClient, ProbeTarget,
    crypto::{
        KlapEncryptionSession, generate_auth_hash_v2,
        klap::{handshake1_seed_auth_hash_v2, handshake2_seed_auth_hash_v2},
        xor,
    },
};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};

/// Payload and meter data a simulated device answers with.
#[derive(Debug, Clone)]
pub struct DeviceModel {
    pub sysinfo: Value,
    /// `get_realtime` payload per outlet; `None` is the device itself.
    pub realtime: Vec<(Option<String>, Value)>,
    pub emeter_module: &'static str,
    pub today_wh: f64,
    pub month_wh: f64,
}

impl DeviceModel {
    pub fn new(sysinfo: Value) -> Self {
        Self {
            sysinfo,
            realtime: Vec::new(),
            emeter_module: "emeter",
            today_wh: 0.0,
            month_wh: 0.0,
        }
    }

    pub fn with_realtime(mut self, child: Option<&str>, payload: Value) -> Self {
        self.realtime.push((child.map(String::from), payload));
        self
    }

    pub fn with_stats(mut self, today_wh: f64, month_wh: f64) -> Self {
        self.today_wh = today_wh;
        self.month_wh = month_wh;
        self
    }

    pub fn with_emeter_module(mut self, module: &'static str) -> Self {
        self.emeter_module = module;
        self
    }

    /// Answers one JSON command the way IOT firmware does.
    pub fn respond(&self, request: &[u8]) -> Vec<u8> {
        let Ok(command) = serde_json::from_slice::<Value>(request) else {
            return br#"{"err_code":-1,"err_msg":"invalid json"}"#.to_vec();
        };
        let child = command["context"]["child_ids"][0].as_str();
        let today = chrono::Local::now().date_naive();

        let mut reply = json!({});
        let Some(modules) = command.as_object() else {
            return br#"{"err_code":-1}"#.to_vec();
        };
        for (module, methods) in modules {
            if module == "context" {
                continue;
            }
            let Some(methods) = methods.as_object() else {
                continue;
            };
            for (method, args) in methods {
                let result = match (module.as_str(), method.as_str()) {
                    ("system", "get_sysinfo") => {
                        let mut info = self.sysinfo.clone();
                        info["err_code"] = json!(0);
                        info
                    }
                    ("system", "set_relay_state") => json!({ "err_code": 0 }),
                    (m, "transition_light_state") if m.ends_with("lightingservice") => {
                        json!({ "on_off": args["on_off"], "err_code": 0 })
                    }
                    (m, "get_realtime") if m == self.emeter_module => self
                        .realtime
                        .iter()
                        .find(|(id, _)| id.as_deref() == child)
                        .map(|(_, payload)| {
                            let mut payload = payload.clone();
                            payload["err_code"] = json!(0);
                            payload
                        })
                        .unwrap_or_else(
                            || json!({ "err_code": -1, "err_msg": "module not support" }),
                        ),
                    (m, "get_daystat") if m == self.emeter_module => json!({
                        "day_list": [{
                            "year": args["year"],
                            "month": args["month"],
                            "day": today.day(),
                            "energy_wh": self.today_wh,
                        }],
                        "err_code": 0,
                    }),
                    (m, "get_monthstat") if m == self.emeter_module => json!({
                        "month_list": [{
                            "year": args["year"],
                            "month": today.month(),
                            "energy_wh": self.month_wh,
                        }],
                        "err_code": 0,
                    }),
                    _ => json!({ "err_code": -2, "err_msg": "module not support" }),
                };
                reply[module.as_str()][method.as_str()] = result;
            }
        }
        reply.to_string().into_bytes()
    }
}

/// Binds a TCP listener and a UDP socket on the same loopback port.
async fn bind_pair() -> (TcpListener, UdpSocket) {
    for _ in 0..20 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        if let Ok(udp) = UdpSocket::bind(("127.0.0.1", port)).await {
            return (listener, udp);
        }
    }
    panic!("no free TCP/UDP port pair");
}

fn is_sysinfo_query(data: &[u8]) -> bool {
    serde_json::from_slice::<Value>(&xor::decrypt(data))
        .is_ok_and(|v| v["system"]["get_sysinfo"].is_object())
}

/// Answers legacy UDP discovery probes with the model's sysinfo.
fn serve_legacy_probes(udp: UdpSocket, model: Arc<DeviceModel>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((n, from)) = udp.recv_from(&mut buf).await {
            if is_sysinfo_query(&buf[..n]) {
                let reply = model.respond(br#"{"system":{"get_sysinfo":{}}}"#);
                let _ = udp.send_to(&xor::encrypt(&reply), from).await;
            }
        }
    });
}

/// A device speaking the legacy protocol on TCP and UDP at one port.
pub async fn spawn_legacy(model: DeviceModel) -> SocketAddr {
    let (listener, udp) = bind_pair().await;
    let addr = listener.local_addr().unwrap();
    let model = Arc::new(model);
    serve_legacy_probes(udp, model.clone());

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let model = model.clone();
            tokio::spawn(async move {
                let mut len = [0u8; 4];
                if stream.read_exact(&mut len).await.is_err() {
                    return;
                }
                let len = u32::from_be_bytes(len) as usize;
                if len > 1024 * 1024 {
                    return;
                }
                let mut payload = vec![0u8; len];
                if stream.read_exact(&mut payload).await.is_err() {
                    return;
                }
                let reply = model.respond(&xor::decrypt(&payload));
                let _ = stream.write_all(&xor::frame(&reply)).await;
            });
        }
    });
    addr
}

/// A device that answers legacy UDP probes but never replies over TCP.
pub async fn spawn_silent(model: DeviceModel) -> SocketAddr {
    let (listener, udp) = bind_pair().await;
    let addr = listener.local_addr().unwrap();
    serve_legacy_probes(udp, Arc::new(model));

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

/// Behaviour switches for [`spawn_klap`].
#[derive(Debug, Clone)]
pub struct KlapOptions {
    pub credentials: Credentials,
    /// `TIMEOUT` attribute of the session cookie, in seconds.
    pub cookie_timeout: u64,
    /// Forget the session after this many requests, answering 403.
    pub forget_after: Option<usize>,
    /// Answer every request with the first reply ever sent.
    pub replay_replies: bool,
}

impl KlapOptions {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            cookie_timeout: 86400,
            forget_after: None,
            replay_replies: false,
        }
    }
}

#[derive(Default)]
struct KlapDeviceState {
    pending: Option<([u8; 16], [u8; 16])>,
    session: Option<KlapEncryptionSession>,
    served: usize,
    first_reply: Option<Vec<u8>>,
}

/// A KLAP device: HTTP endpoint plus TDP discovery responder.
#[derive(Debug, Clone)]
pub struct KlapSim {
    pub http_addr: SocketAddr,
    pub tdp_addr: SocketAddr,
    pub handshakes: Arc<AtomicUsize>,
    pub rejected: Arc<AtomicUsize>,
}

impl KlapSim {
    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn address(&self) -> DeviceAddress {
        DeviceAddress::from(self.http_addr)
    }
}

pub async fn spawn_klap(model: DeviceModel, options: KlapOptions) -> KlapSim {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = listener.local_addr().unwrap();
    let tdp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tdp_addr = tdp.local_addr().unwrap();

    let device_id = model.sysinfo["deviceId"].as_str().unwrap_or("unknown").to_string();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        while let Ok((n, from)) = tdp.recv_from(&mut buf).await {
            if n < 16 || buf[0] != 2 {
                continue;
            }
            let body = json!({
                "error_code": 0,
                "result": {
                    "device_id": device_id,
                    "device_type": "IOT.SMARTPLUGSWITCH",
                    "device_model": "KP125M(US)",
                    "ip": "127.0.0.1",
                    "mac": "AA-BB-CC-DD-EE-FF",
                    "mgt_encrypt_schm": {
                        "encrypt_type": "KLAP",
                        "http_port": http_addr.port(),
                        "lv": 2,
                        "new_klap": 1
                    }
                }
            });
            let mut reply = vec![2u8, 0, 0, 2];
            reply.resize(16, 0);
            reply.extend_from_slice(body.to_string().as_bytes());
            let _ = tdp.send_to(&reply, from).await;
        }
    });

    let sim = KlapSim {
        http_addr,
        tdp_addr,
        handshakes: Arc::new(AtomicUsize::new(0)),
        rejected: Arc::new(AtomicUsize::new(0)),
    };
    let state = Arc::new(Mutex::new(KlapDeviceState::default()));
    let model = Arc::new(model);
    let auth = generate_auth_hash_v2(&options.credentials);
    let options = Arc::new(options);
    let handshakes = sim.handshakes.clone();
    let rejected = sim.rejected.clone();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let state = state.clone();
            let model = model.clone();
            let options = options.clone();
            let handshakes = handshakes.clone();
            let rejected = rejected.clone();
            tokio::spawn(async move {
                let Some((path, body)) = read_http_request(&mut stream).await else {
                    return;
                };
                let (status, reply, cookie) = {
                    let mut state = state.lock().unwrap();
                    handle_klap(&mut state, &path, &body, &auth, &model, &options)
                };
                match status {
                    200 if path == "/app/handshake2" => {
                        handshakes.fetch_add(1, Ordering::SeqCst);
                    }
                    403 => {
                        rejected.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {}
                }
                write_http_response(&mut stream, status, &reply, cookie).await;
            });
        }
    });
    sim
}

fn handle_klap(
    state: &mut KlapDeviceState,
    path: &str,
    body: &[u8],
    auth: &[u8; 32],
    model: &DeviceModel,
    options: &KlapOptions,
) -> (u16, Vec<u8>, Option<String>) {
    match path.split('?').next().unwrap_or_default() {
        "/app/handshake1" => {
            let Ok(local) = <[u8; 16]>::try_from(body) else {
                return (400, Vec::new(), None);
            };
            let remote: [u8; 16] = rand::random();
            state.pending = Some((local, remote));
            state.session = None;
            let mut reply = remote.to_vec();
            reply.extend_from_slice(&handshake1_seed_auth_hash_v2(&local, &remote, auth));
            let cookie = format!(
                "TP_SESSIONID={};TIMEOUT={}",
                hex::encode(remote),
                options.cookie_timeout
            );
            (200, reply, Some(cookie))
        }
        "/app/handshake2" => {
            let Some((local, remote)) = state.pending.take() else {
                return (403, Vec::new(), None);
            };
            if body != handshake2_seed_auth_hash_v2(&local, &remote, auth) {
                return (403, Vec::new(), None);
            }
            state.session = Some(KlapEncryptionSession::new(&local, &remote, auth));
            state.served = 0;
            (200, Vec::new(), None)
        }
        "/app/request" => {
            let Some(seq) = path
                .split_once("seq=")
                .and_then(|(_, seq)| seq.parse::<i32>().ok())
            else {
                return (400, Vec::new(), None);
            };
            if options.forget_after.is_some_and(|limit| state.served >= limit) {
                state.session = None;
            }
            let Some(session) = state.session.as_mut() else {
                return (403, Vec::new(), None);
            };
            let Ok(plain) = session.decrypt(body, seq) else {
                return (403, Vec::new(), None);
            };
            state.served += 1;
            let encrypted = session.encrypt_with_seq(&model.respond(&plain), seq);
            if options.replay_replies {
                let first = state.first_reply.get_or_insert(encrypted);
                return (200, first.clone(), None);
            }
            (200, encrypted, None)
        }
        _ => (404, Vec::new(), None),
    }
}

async fn read_http_request(stream: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };
    let headers = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let path = headers.lines().next()?.split_whitespace().nth(1)?.to_string();
    let length = headers
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    let body_start = header_end + 4;
    while data.len() < body_start + length {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
    }
    Some((path, data[body_start..body_start + length].to_vec()))
}

async fn write_http_response(
    stream: &mut TcpStream,
    status: u16,
    body: &[u8],
    cookie: Option<String>,
) {
    let reason = match status {
        200 => "OK",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Bad Request",
    };
    let mut head = format!("HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\n", body.len());
    if let Some(cookie) = cookie {
        head.push_str(&format!("Set-Cookie: {cookie}\r\n"));
    }
    head.push_str("Connection: close\r\n\r\n");
    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    let _ = stream.write_all(&out).await;
    let _ = stream.shutdown().await;
}

/// A loopback port with nothing listening on it.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn owner() -> Credentials {
    Credentials::new("owner@example.com", "s3cret")
}

/// Client tuned for loopback simulators: short timeouts, no retries.
pub fn test_client(credentials: Option<Credentials>) -> DeviceClient {
    DeviceClient::new(
        ClientConfig::default()
            .with_credentials(credentials)
            .with_timeout(Duration::from_millis(400))
            .with_retries(0, Duration::from_millis(10)),
    )
}

pub fn legacy_probe(addr: SocketAddr) -> ProbeTarget {
    ProbeTarget::legacy(addr)
}

pub fn tdp_probe(sim: &KlapSim) -> ProbeTarget {
    ProbeTarget::tdp(sim.tdp_addr)
}

pub fn plug_model(device_id: &str, alias: &str) -> DeviceModel {
    DeviceModel::new(json!({
        "alias": alias,
        "model": "KP115(US)",
        "deviceId": device_id,
        "type": "IOT.SMARTPLUGSWITCH",
        "relay_state": 1,
        "led_off": 0,
        "feature": "TIM:ENE",
        "mac": "50:C7:BF:00:00:01",
        "sw_ver": "1.0.20",
        "hw_ver": "1.0",
        "rssi": -48,
    }))
}

pub fn bulb_model(device_id: &str, alias: &str) -> DeviceModel {
    DeviceModel::new(json!({
        "alias": alias,
        "model": "KL130(US)",
        "deviceId": device_id,
        "mic_type": "IOT.SMARTBULB",
        "mic_mac": "50C7BF000002",
        "is_color": 1,
        "is_variable_color_temp": 1,
        "is_dimmable": 1,
        "light_state": {
            "on_off": 1,
            "brightness": 80,
            "color_temp": 0,
            "hue": 30,
            "saturation": 50,
        },
    }))
    .with_emeter_module("smartlife.iot.common.emeter")
}

pub fn strip_model(device_id: &str, alias: &str) -> DeviceModel {
    DeviceModel::new(json!({
        "alias": alias,
        "model": "HS300(US)",
        "deviceId": device_id,
        "type": "IOT.SMARTPLUGSWITCH",
        "feature": "TIM:ENE",
        "children": [
            { "id": format!("{device_id}00"), "alias": "Outlet 1", "state": 1 },
            { "id": format!("{device_id}01"), "alias": "Outlet 2", "state": 0 },
        ],
    }))
}
