mod common;

use std::time::Duration;

use common::{
    KlapOptions, bulb_model, owner, plug_model, spawn_klap, spawn_legacy, spawn_silent,
    strip_model, test_client,
};
use kasa_bridge_core::{
    DeviceAddress, DeviceType, Discoverer, DiscoveryConfig, EncryptionType, Error,
};
use serde_json::json;

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[tokio::test]
async fn test_legacy_plug_info() {
    let addr = DeviceAddress::from(spawn_legacy(plug_model("LEG-1", "Kettle")).await);
    let client = test_client(None);

    let info = client.update(&addr).await.unwrap();
    assert_eq!(info.device_id, "LEG-1");
    assert_eq!(info.alias, "Kettle");
    assert_eq!(info.device_type, DeviceType::PlugEnergy);
    assert_eq!(info.host, "127.0.0.1");
    assert!(info.is_on);
    assert!(info.has_energy_monitoring);
    assert_eq!(info.led_off, Some(false));
    assert_eq!(client.session_variant(&addr).await, Some(EncryptionType::Xor));
}

#[tokio::test]
async fn test_session_variant_is_remembered() {
    let sim = spawn_klap(plug_model("KLAP-1", "Desk"), KlapOptions::new(owner())).await;
    let client = test_client(Some(owner()));
    let addr = sim.address();

    client.update(&addr).await.unwrap();
    let first = client.last_handshake(&addr).await;
    client.update(&addr).await.unwrap();
    client.update(&addr).await.unwrap();

    assert_eq!(client.session_variant(&addr).await, Some(EncryptionType::Klap));
    assert_eq!(client.last_handshake(&addr).await, first);
    assert_eq!(sim.handshakes(), 1);

    client.forget(&addr).await;
    assert_eq!(client.session_variant(&addr).await, None);
    assert_eq!(client.last_handshake(&addr).await, None);
}

#[tokio::test]
async fn test_forget_keeps_one_session_per_device() {
    let sim = spawn_klap(plug_model("KLAP-7", "Desk"), KlapOptions::new(owner())).await;
    let client = test_client(Some(owner()));
    let addr = sim.address();

    client.update(&addr).await.unwrap();
    let ((), updated) = tokio::join!(client.forget(&addr), client.update(&addr));
    updated.unwrap();
    client.update(&addr).await.unwrap();

    assert_eq!(sim.handshakes(), 2);
    assert_eq!(client.session_variant(&addr).await, Some(EncryptionType::Klap));
}

#[tokio::test]
async fn test_wrong_credentials_surface_as_authentication_failure() {
    let sim = spawn_klap(plug_model("KLAP-2", "Desk"), KlapOptions::new(owner())).await;
    let client = test_client(Some(kasa_bridge_core::Credentials::new("someone@else", "x")));

    let err = client.update(&sim.address()).await.unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed(_)), "{err:?}");
}

#[tokio::test]
async fn test_energy_normalizes_milli_units() {
    let model = plug_model("LEG-2", "Heater")
        .with_realtime(
            None,
            json!({ "power_mw": 1500, "voltage_mv": 120000, "current_ma": 12, "total_wh": 3500 }),
        )
        .with_stats(250.0, 9000.0);
    let addr = DeviceAddress::from(spawn_legacy(model).await);
    let client = test_client(None);

    let reading = client.energy(&addr).await.unwrap().unwrap();
    assert_eq!(reading.device_id, "LEG-2");
    assert!(approx(reading.current_power, 1.5));
    assert!(approx(reading.voltage, 120.0));
    assert!(approx(reading.current, 0.012));
    assert!(approx(reading.total_energy, 3.5));
    assert!(approx(reading.today_energy, 0.25));
    assert!(approx(reading.month_energy, 9.0));
}

#[tokio::test]
async fn test_energy_prefers_base_units() {
    let model = plug_model("KLAP-3", "Fridge").with_realtime(
        None,
        json!({ "power": 0.0, "power_mw": 999, "voltage": 230.5, "current": 0.4, "total": 12.0 }),
    );
    let sim = spawn_klap(model, KlapOptions::new(owner())).await;
    let client = test_client(Some(owner()));

    let reading = client.energy(&sim.address()).await.unwrap().unwrap();
    assert!(approx(reading.current_power, 0.0));
    assert!(approx(reading.voltage, 230.5));
    assert!(approx(reading.current, 0.4));
    assert!(approx(reading.total_energy, 12.0));
}

#[tokio::test]
async fn test_energy_absent_without_meter() {
    let mut model = plug_model("LEG-3", "Lamp plug");
    model.sysinfo["feature"] = json!("TIM");
    let addr = DeviceAddress::from(spawn_legacy(model).await);
    let client = test_client(None);

    assert_eq!(client.update(&addr).await.unwrap().device_type, DeviceType::Plug);
    assert!(client.energy(&addr).await.unwrap().is_none());
}

#[tokio::test]
async fn test_bulb_energy_uses_bulb_module() {
    let mut model = bulb_model("KLAP-4", "Reading lamp")
        .with_realtime(None, json!({ "power_mw": 9000 }))
        .with_stats(10.0, 300.0);
    model.sysinfo["has_emeter"] = json!(true);
    let sim = spawn_klap(model, KlapOptions::new(owner())).await;
    let client = test_client(Some(owner()));

    let info = client.update(&sim.address()).await.unwrap();
    assert_eq!(info.device_type, DeviceType::BulbColor);
    assert_eq!(info.mac.as_deref(), Some("50:C7:BF:00:00:02"));
    assert_eq!(info.brightness, Some(80));
    assert_eq!(info.color_temp, None);
    assert_eq!((info.hue, info.saturation), (Some(30), Some(50)));

    let reading = client.energy(&sim.address()).await.unwrap().unwrap();
    assert!(approx(reading.current_power, 9.0));
    assert!(approx(reading.month_energy, 0.3));
}

#[tokio::test]
async fn test_strip_energy_sums_outlets() {
    let model = strip_model("STRIP", "Bench")
        .with_realtime(
            Some("STRIP00"),
            json!({ "power_mw": 1000, "voltage_mv": 120000, "current_ma": 10, "total_wh": 500 }),
        )
        .with_realtime(
            Some("STRIP01"),
            json!({ "power_mw": 3000, "voltage_mv": 122000, "current_ma": 30, "total_wh": 1500 }),
        )
        .with_stats(100.0, 2000.0);
    let addr = DeviceAddress::from(spawn_legacy(model).await);
    let client = test_client(None);

    let info = client.update(&addr).await.unwrap();
    assert_eq!(info.device_type, DeviceType::PowerStrip);
    assert!(info.is_on);
    let children = info.children.unwrap();
    assert_eq!(children.len(), 2);
    assert!(children[0].is_on && !children[1].is_on);

    let reading = client.energy(&addr).await.unwrap().unwrap();
    assert!(approx(reading.current_power, 4.0));
    assert!(approx(reading.voltage, 121.0));
    assert!(approx(reading.current, 0.04));
    assert!(approx(reading.total_energy, 2.0));
    assert!(approx(reading.today_energy, 0.2));
    assert!(approx(reading.month_energy, 4.0));
}

#[tokio::test]
async fn test_set_power() {
    let addr = DeviceAddress::from(spawn_legacy(strip_model("STRIP2", "Desk strip")).await);
    let client = test_client(None);

    client.set_power(&addr, false, None).await.unwrap();
    client.set_power(&addr, true, Some("STRIP201")).await.unwrap();

    let sim = spawn_klap(bulb_model("KLAP-5", "Ceiling"), KlapOptions::new(owner())).await;
    let client = test_client(Some(owner()));
    client.set_power(&sim.address(), false, None).await.unwrap();
}

#[tokio::test]
async fn test_one_silent_device_does_not_block_others() {
    let klap = spawn_klap(plug_model("KLAP-6", "Office"), KlapOptions::new(owner())).await;
    let legacy = spawn_legacy(plug_model("LEG-4", "Kitchen")).await;
    let silent = spawn_silent(plug_model("SILENT", "Attic")).await;

    let discoverer = Discoverer::new(test_client(Some(owner())), DiscoveryConfig::default());
    let addrs = [
        klap.address(),
        DeviceAddress::from(silent),
        DeviceAddress::from(legacy),
    ];
    let report = discoverer.update_hosts(&addrs, Duration::from_millis(200)).await;

    let ids: Vec<&str> = report.items.iter().map(|d| d.device_id.as_str()).collect();
    assert_eq!(ids, ["KLAP-6", "LEG-4"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].addr, DeviceAddress::from(silent));
    assert!(
        matches!(report.failures[0].error, Error::Unreachable(_)),
        "{:?}",
        report.failures[0].error
    );
}
