use std::time::Duration;

use kasa_bridge_core::{DeviceAddress, DeviceInfo, Discoverer};
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::utils::{device_error, parse_addresses, required, split_ips};

/// How long a single-device command waits for its unicast probe answer.
const PROBE_WINDOW: Duration = Duration::from_secs(2);

/// Outcome of a command: JSON for stdout, or a message for `{"error": …}`
/// and exit code 1.
pub type Outcome = Result<Value, String>;

/// Handle the discover command.
pub async fn handle_discover(discoverer: &Discoverer, timeout: Duration) -> Outcome {
    let devices = discover(discoverer, timeout).await?;
    Ok(json!({ "devices": devices }))
}

/// Handle the get-device command.
pub async fn handle_get_device(discoverer: &Discoverer, ip: &Option<String>) -> Outcome {
    let ip = required(ip).ok_or("No IP specified")?;
    let addr: DeviceAddress = match ip.parse() {
        Ok(addr) => addr,
        Err(e) => return Ok(json!({ "device": device_error(ip, e) })),
    };
    let device = match discoverer.discover_single(&addr, PROBE_WINDOW).await {
        Ok(device) => json!(device),
        Err(e) => {
            debug!(%addr, error = %e, "get-device failed");
            device_error(ip, e)
        }
    };
    Ok(json!({ "device": device }))
}

/// Handle the get-devices command.
pub async fn handle_get_devices(discoverer: &Discoverer, ips: &Option<String>) -> Outcome {
    let ips = required(ips).ok_or("No IPs specified")?;
    let devices = get_devices(discoverer, &split_ips(ips)).await;
    Ok(json!({ "devices": devices }))
}

/// Handle the get-energy command.
pub async fn handle_get_energy(discoverer: &Discoverer, ip: &Option<String>) -> Outcome {
    let ip = required(ip).ok_or("No IP specified")?;
    let addr: DeviceAddress = match ip.parse() {
        Ok(addr) => addr,
        Err(e) => return Ok(json!({ "energy": device_error(ip, e) })),
    };
    let energy = match discoverer.energy_single(&addr, PROBE_WINDOW).await {
        Ok(energy) => json!(energy),
        Err(e) => {
            debug!(%addr, error = %e, "get-energy failed");
            device_error(ip, e)
        }
    };
    Ok(json!({ "energy": energy }))
}

/// Handle the get-all-energy command.
pub async fn handle_get_all_energy(discoverer: &Discoverer, ips: &Option<String>) -> Outcome {
    let ips = required(ips).ok_or("No IPs specified")?;
    let addrs = parse_addresses(&split_ips(ips));
    let report = discoverer.energy_hosts(&addrs, PROBE_WINDOW).await;
    for failure in &report.failures {
        eprintln!("Error for {}: {}", failure.addr, failure.error);
    }
    Ok(json!({ "devices": report.items }))
}

/// Handle the test command.
///
/// With a non-empty IP argument the listed devices are queried; otherwise
/// the network is searched for `timeout`. Finding nothing is reported in
/// the JSON, not through the exit code.
pub async fn handle_test(
    discoverer: &Discoverer,
    ips: &Option<String>,
    timeout: Duration,
) -> Outcome {
    let (devices, empty_message) = match ips.as_deref().filter(|raw| !raw.is_empty()) {
        Some(raw) => (
            get_devices(discoverer, &split_ips(raw)).await,
            "No devices found at specified IPs",
        ),
        None => (discover(discoverer, timeout).await?, "No devices discovered"),
    };

    if devices.is_empty() {
        return Ok(json!({ "success": false, "error": empty_message }));
    }
    Ok(json!({ "success": true, "count": devices.len(), "devices": devices }))
}

async fn discover(discoverer: &Discoverer, timeout: Duration) -> Result<Vec<DeviceInfo>, String> {
    let report = discoverer.discover_with_report(timeout).await.map_err(|e| {
        error!(error = %e, "discovery failed");
        e.to_string()
    })?;
    for failure in &report.failures {
        eprintln!("Error updating device {}: {}", failure.addr, failure.error);
    }
    Ok(report.devices)
}

async fn get_devices(discoverer: &Discoverer, ips: &[&str]) -> Vec<DeviceInfo> {
    let addrs = parse_addresses(ips);
    let report = discoverer.update_hosts(&addrs, PROBE_WINDOW).await;
    for failure in &report.failures {
        eprintln!("Error for {}: {}", failure.addr, failure.error);
    }
    report.items
}
