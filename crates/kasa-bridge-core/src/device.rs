//! Normalized device model and capability resolver.
//!
//! [`DeviceInfo::from_sysinfo_response`] turns a raw `get_sysinfo` reply into
//! the uniform snapshot callers see. Nothing here does I/O; the same input
//! always yields the same output.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::response::{self, SysInfo};

/// Normalized device kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    PowerStrip,
    BulbColor,
    BulbTunable,
    BulbDimmable,
    Bulb,
    PlugEnergy,
    Plug,
    Dimmer,
}

impl DeviceType {
    pub fn is_bulb(self) -> bool {
        matches!(
            self,
            DeviceType::BulbColor
                | DeviceType::BulbTunable
                | DeviceType::BulbDimmable
                | DeviceType::Bulb
        )
    }
}

/// Capability tags for one device, explicit where the device reported a
/// flag and derived from its type string otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub is_strip: bool,
    pub is_bulb: bool,
    pub is_plug: bool,
    pub is_dimmer: bool,
    pub is_color: bool,
    pub is_variable_color_temp: bool,
    pub is_dimmable: bool,
    pub has_emeter: bool,
    /// Lowercase type name: `strip`, `bulb`, `dimmer`, `plug`, or the raw
    /// type string when none of those apply.
    pub type_name: String,
}

impl Capabilities {
    pub fn from_sysinfo(info: &SysInfo) -> Self {
        let type_string = info.type_string().unwrap_or_default().to_ascii_uppercase();
        let plug_switch = type_string.contains("SMARTPLUGSWITCH");
        let bulb = type_string.contains("SMARTBULB");
        let strip = plug_switch && !info.children().is_empty();
        let dimmer = plug_switch
            && !strip
            && (info.dev_name.as_deref().is_some_and(|n| n.contains("Dimmer"))
                || info.brightness.is_some());
        let metered = info
            .feature
            .as_deref()
            .is_some_and(|f| f.split(':').any(|code| code == "ENE"));

        let type_name = if strip {
            "strip".to_string()
        } else if bulb {
            "bulb".to_string()
        } else if dimmer {
            "dimmer".to_string()
        } else if plug_switch {
            "plug".to_string()
        } else {
            type_string.to_ascii_lowercase()
        };

        Self {
            is_strip: info.is_strip.unwrap_or(strip),
            is_bulb: info.is_bulb.unwrap_or(bulb),
            is_plug: info.is_plug.unwrap_or(plug_switch && !strip && !dimmer),
            is_dimmer: info.is_dimmer.unwrap_or(dimmer),
            is_color: info.is_color.unwrap_or(false),
            is_variable_color_temp: info.is_variable_color_temp.unwrap_or(false),
            is_dimmable: info.is_dimmable.unwrap_or(false),
            has_emeter: info.has_emeter.unwrap_or(metered),
            type_name,
        }
    }

    /// Resolves the device type; the first matching rule wins.
    pub fn device_type(&self) -> DeviceType {
        let name = self.type_name.as_str();
        if self.is_strip || name.contains("strip") {
            return DeviceType::PowerStrip;
        }
        if self.is_bulb {
            return if self.is_color {
                DeviceType::BulbColor
            } else if self.is_variable_color_temp {
                DeviceType::BulbTunable
            } else if self.is_dimmable {
                DeviceType::BulbDimmable
            } else {
                DeviceType::Bulb
            };
        }
        if name.contains("bulb") {
            return DeviceType::Bulb;
        }
        if self.is_plug || name.contains("plug") {
            return if self.has_emeter {
                DeviceType::PlugEnergy
            } else {
                DeviceType::Plug
            };
        }
        if self.is_dimmer || name.contains("dimmer") {
            return DeviceType::Dimmer;
        }
        DeviceType::Plug
    }
}

/// One outlet of a power strip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildDevice {
    pub id: String,
    pub alias: String,
    pub is_on: bool,
}

/// Normalized device snapshot, serialized in camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub alias: String,
    pub device_type: DeviceType,
    pub model: String,
    pub host: String,
    pub is_on: bool,
    pub has_energy_monitoring: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub led_off: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_temp: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hue: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saturation: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ChildDevice>>,
}

const UNKNOWN: &str = "Unknown";

impl DeviceInfo {
    /// Builds a snapshot from a full `{"system":{"get_sysinfo":…}}` reply.
    ///
    /// Fails with [`Error::UnsupportedDevice`] when the reply has no sysinfo,
    /// or reports neither a type string nor any capability flag.
    pub fn from_sysinfo_response(raw: &Value, host: &str) -> Result<Self, Error> {
        let info: SysInfo = response::parse_method(raw, "system", "get_sysinfo")?
            .ok_or_else(|| Error::UnsupportedDevice(format!("{host}: no system.get_sysinfo")))?;
        Self::from_sysinfo(&info, host)
    }

    pub fn from_sysinfo(info: &SysInfo, host: &str) -> Result<Self, Error> {
        if info.type_string().is_none() && !info.has_capability_flags() {
            return Err(Error::UnsupportedDevice(format!(
                "{host}: sysinfo has no type or capability flags"
            )));
        }

        let caps = Capabilities::from_sysinfo(info);
        let device_type = caps.device_type();
        let children = info.children();

        let is_on = if device_type.is_bulb() {
            info.light_state
                .as_ref()
                .is_some_and(|s| s.on_off == Some(1))
        } else if device_type == DeviceType::PowerStrip && !children.is_empty() {
            children.iter().any(|c| c.is_on())
        } else {
            info.relay_state == Some(1)
        };

        let light = info.effective_light_state();
        let brightness = light.and_then(|l| l.brightness).or(info.brightness);
        let (hue, saturation) = if caps.is_color {
            (light.and_then(|l| l.hue), light.and_then(|l| l.saturation))
        } else {
            (None, None)
        };

        Ok(Self {
            device_id: non_empty(info.device_id.as_deref()).unwrap_or(host).to_string(),
            alias: non_empty(info.alias.as_deref()).unwrap_or(UNKNOWN).to_string(),
            device_type,
            model: non_empty(info.model.as_deref()).unwrap_or(UNKNOWN).to_string(),
            host: host.to_string(),
            is_on,
            has_energy_monitoring: caps.has_emeter,
            mac: info.mac_address(),
            fw_version: info.sw_ver.clone(),
            hw_version: info.hw_ver.clone(),
            rssi: info.rssi,
            led_off: info.led_off,
            brightness,
            color_temp: light.and_then(|l| l.color_temp).filter(|&t| t != 0),
            hue,
            saturation,
            children: (!children.is_empty()).then(|| {
                children
                    .iter()
                    .map(|c| ChildDevice {
                        id: non_empty(c.id.as_deref()).unwrap_or("unknown").to_string(),
                        alias: non_empty(c.alias.as_deref()).unwrap_or(UNKNOWN).to_string(),
                        is_on: c.is_on(),
                    })
                    .collect()
            }),
        })
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

/// Energy snapshot in W, V, A and kWh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyReading {
    pub device_id: String,
    pub alias: String,
    pub current_power: f64,
    pub voltage: f64,
    pub current: f64,
    pub today_energy: f64,
    pub month_energy: f64,
    pub total_energy: f64,
}
