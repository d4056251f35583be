//! Raw device response schema.
//!
//! Devices differ in which fields they report, so every field is an
//! `Option` and readers check presence explicitly. Boolean capability flags
//! arrive either as JSON booleans or as `0`/`1`; [`deserialize_flag`] accepts
//! both.
//!
//! ```
//! use kasa_bridge_core::response::SysInfo;
//!
//! let info: SysInfo = serde_json::from_str(r#"{"alias":"Lamp","is_bulb":1}"#).unwrap();
//! assert_eq!(info.alias.as_deref(), Some("Lamp"));
//! assert_eq!(info.is_bulb, Some(true));
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::Error;

/// Accepts `true`/`false`, `0`/`1` (any non-zero number is `true`) or null.
pub fn deserialize_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Float(f64),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        None => None,
        Some(Flag::Bool(b)) => Some(b),
        Some(Flag::Int(i)) => Some(i != 0),
        Some(Flag::Float(f)) => Some(f != 0.0),
    })
}

/// Looks up `{module: {method: {...}}}` and checks its `err_code`.
///
/// Returns `Ok(None)` when the module or method is absent.
pub fn method_result<'a>(
    response: &'a Value,
    module: &str,
    method: &str,
) -> Result<Option<&'a Value>, Error> {
    let Some(result) = response.get(module).and_then(|m| m.get(method)) else {
        return Ok(None);
    };
    match result.get("err_code").and_then(Value::as_i64) {
        Some(code) if code != 0 => {
            let msg = result
                .get("err_msg")
                .and_then(Value::as_str)
                .unwrap_or("no message");
            Err(Error::DeviceError(format!(
                "{module}.{method} returned err_code {code}: {msg}"
            )))
        }
        _ => Ok(Some(result)),
    }
}

/// Parses `{module: {method: T}}` into `T`.
pub fn parse_method<T: DeserializeOwned>(
    response: &Value,
    module: &str,
    method: &str,
) -> Result<Option<T>, Error> {
    method_result(response, module, method)?
        .map(|v| {
            T::deserialize(v)
                .map_err(|e| Error::MalformedResponse(format!("{module}.{method}: {e}")))
        })
        .transpose()
}

/// `system.get_sysinfo` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SysInfo {
    pub alias: Option<String>,
    pub model: Option<String>,
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    pub mac: Option<String>,
    /// Bulbs report their MAC here, without separators.
    pub mic_mac: Option<String>,
    pub hw_ver: Option<String>,
    pub sw_ver: Option<String>,
    pub rssi: Option<i64>,
    pub relay_state: Option<u8>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub led_off: Option<bool>,
    /// Device type string, e.g. `IOT.SMARTPLUGSWITCH`.
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    /// Type string used by bulbs, e.g. `IOT.SMARTBULB`.
    pub mic_type: Option<String>,
    pub dev_name: Option<String>,
    /// Colon-separated feature codes; `ENE` means energy metering.
    pub feature: Option<String>,
    /// Dimmer switches report brightness at the top level.
    pub brightness: Option<u32>,
    pub light_state: Option<LightState>,
    pub children: Option<Vec<ChildPlug>>,

    #[serde(default, deserialize_with = "deserialize_flag")]
    pub is_strip: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub is_bulb: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub is_plug: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub is_dimmer: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub is_color: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub is_variable_color_temp: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub is_dimmable: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub has_emeter: Option<bool>,
}

impl SysInfo {
    /// `type`, falling back to `mic_type`.
    pub fn type_string(&self) -> Option<&str> {
        self.device_type
            .as_deref()
            .or(self.mic_type.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// True when any explicit capability flag was reported.
    pub fn has_capability_flags(&self) -> bool {
        [
            self.is_strip,
            self.is_bulb,
            self.is_plug,
            self.is_dimmer,
            self.is_color,
            self.is_variable_color_temp,
            self.is_dimmable,
            self.has_emeter,
        ]
        .iter()
        .any(Option::is_some)
    }

    /// MAC from `mac`, else `mic_mac` with colons inserted.
    pub fn mac_address(&self) -> Option<String> {
        if let Some(mac) = self.mac.as_deref().filter(|m| !m.is_empty()) {
            return Some(mac.to_string());
        }
        let raw = self.mic_mac.as_deref().filter(|m| !m.is_empty())?;
        if raw.len() == 12 && !raw.contains(':') && raw.is_ascii() {
            let pairs: Vec<&str> = (0..6).map(|i| &raw[i * 2..i * 2 + 2]).collect();
            Some(pairs.join(":"))
        } else {
            Some(raw.to_string())
        }
    }

    pub fn children(&self) -> &[ChildPlug] {
        self.children.as_deref().unwrap_or_default()
    }

    /// The light state that describes the bulb: the live one while on,
    /// `dft_on_state` while off.
    pub fn effective_light_state(&self) -> Option<&LightValues> {
        let state = self.light_state.as_ref()?;
        if state.on_off == Some(0) {
            state.dft_on_state.as_ref().or(Some(&state.values))
        } else {
            Some(&state.values)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LightValues {
    pub brightness: Option<u32>,
    pub color_temp: Option<u32>,
    pub hue: Option<u32>,
    pub saturation: Option<u32>,
}

/// Bulb light state.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LightState {
    pub on_off: Option<u8>,
    #[serde(flatten)]
    pub values: LightValues,
    pub dft_on_state: Option<LightValues>,
}

/// One outlet of a power strip.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChildPlug {
    pub id: Option<String>,
    pub alias: Option<String>,
    pub state: Option<u8>,
}

impl ChildPlug {
    pub fn is_on(&self) -> bool {
        self.state == Some(1)
    }
}

/// `get_realtime` payload in whichever units the device uses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RealtimeReading {
    pub power: Option<f64>,
    pub power_mw: Option<f64>,
    pub voltage: Option<f64>,
    pub voltage_mv: Option<f64>,
    pub current: Option<f64>,
    pub current_ma: Option<f64>,
    /// Total energy in kWh.
    pub total: Option<f64>,
    pub total_wh: Option<f64>,
}

/// Picks the base-unit value when the field is present (zero included),
/// otherwise scales the milli-unit value down.
fn base_or_milli(base: Option<f64>, milli: Option<f64>) -> Option<f64> {
    base.or(milli.map(|m| m / 1000.0))
}

impl RealtimeReading {
    /// Watts.
    pub fn power_w(&self) -> Option<f64> {
        base_or_milli(self.power, self.power_mw)
    }

    /// Volts.
    pub fn voltage_v(&self) -> Option<f64> {
        base_or_milli(self.voltage, self.voltage_mv)
    }

    /// Amps.
    pub fn current_a(&self) -> Option<f64> {
        base_or_milli(self.current, self.current_ma)
    }

    /// Kilowatt-hours.
    pub fn total_kwh(&self) -> Option<f64> {
        base_or_milli(self.total, self.total_wh)
    }
}

/// One entry of `get_daystat.day_list` or `get_monthstat.month_list`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatEntry {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub energy: Option<f64>,
    pub energy_wh: Option<f64>,
}

impl StatEntry {
    pub fn energy_kwh(&self) -> Option<f64> {
        base_or_milli(self.energy, self.energy_wh)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DayStat {
    #[serde(default)]
    pub day_list: Vec<StatEntry>,
}

impl DayStat {
    pub fn energy_on(&self, year: i32, month: u32, day: u32) -> Option<f64> {
        self.day_list
            .iter()
            .find(|e| e.year == Some(year) && e.month == Some(month) && e.day == Some(day))
            .and_then(StatEntry::energy_kwh)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonthStat {
    #[serde(default)]
    pub month_list: Vec<StatEntry>,
}

impl MonthStat {
    pub fn energy_in(&self, year: i32, month: u32) -> Option<f64> {
        self.month_list
            .iter()
            .find(|e| e.year == Some(year) && e.month == Some(month))
            .and_then(StatEntry::energy_kwh)
    }
}
