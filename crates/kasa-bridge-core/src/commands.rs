//! JSON commands understood by Kasa (IOT schema) devices.
//!
//! Fixed queries are plain constants; commands that carry arguments or a
//! module name are built with [`serde_json::json!`].
//!
//! ```
//! use kasa_bridge_core::commands;
//!
//! let cmd = commands::relay_for_child("8006ABCD00", true);
//! assert!(cmd.contains("child_ids"));
//! ```

use serde_json::{Value, json};

/// Get system information.
pub const INFO: &str = r#"{"system":{"get_sysinfo":{}}}"#;

/// Turn the relay on.
pub const RELAY_ON: &str = r#"{"system":{"set_relay_state":{"state":1}}}"#;

/// Turn the relay off.
pub const RELAY_OFF: &str = r#"{"system":{"set_relay_state":{"state":0}}}"#;

/// Energy meter module on plugs and strips.
pub const EMETER: &str = "emeter";

/// Energy meter module on bulbs.
pub const BULB_EMETER: &str = "smartlife.iot.common.emeter";

/// Lighting service module on bulbs.
pub const LIGHTING_SERVICE: &str = "smartlife.iot.smartbulb.lightingservice";

/// Wraps `command` so that it targets the strip outlet `child_id`.
pub fn with_child_context(child_id: &str, mut command: Value) -> Value {
    if let Some(map) = command.as_object_mut() {
        map.insert("context".into(), json!({ "child_ids": [child_id] }));
    }
    command
}

/// Relay command for one strip outlet.
pub fn relay_for_child(child_id: &str, on: bool) -> String {
    with_child_context(
        child_id,
        json!({ "system": { "set_relay_state": { "state": u8::from(on) } } }),
    )
    .to_string()
}

/// Turns a bulb on or off through its lighting service.
pub fn light_power(on: bool) -> String {
    json!({ LIGHTING_SERVICE: { "transition_light_state": { "on_off": u8::from(on) } } })
        .to_string()
}

pub fn realtime(module: &str) -> Value {
    json!({ module: { "get_realtime": {} } })
}

/// Daily statistics for one month.
pub fn daystat(module: &str, year: i32, month: u32) -> Value {
    json!({ module: { "get_daystat": { "year": year, "month": month } } })
}

/// Monthly statistics for one year.
pub fn monthstat(module: &str, year: i32) -> Value {
    json!({ module: { "get_monthstat": { "year": year } } })
}
