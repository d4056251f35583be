use kasa_bridge_core::DeviceAddress;
use serde_json::{Value, json};

/// Splits a comma-separated IP list, dropping blank entries.
pub fn split_ips(raw: &str) -> Vec<&str> {
    raw.split(',').map(str::trim).filter(|ip| !ip.is_empty()).collect()
}

/// Parses each entry, reporting the bad ones on stderr.
pub fn parse_addresses(ips: &[&str]) -> Vec<DeviceAddress> {
    ips.iter()
        .filter_map(|ip| match ip.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                eprintln!("Error for {ip}: {e}");
                None
            }
        })
        .collect()
}

/// The `{"error": …, "ip": …}` object used in place of a device result.
pub fn device_error(ip: &str, error: impl std::fmt::Display) -> Value {
    json!({ "error": error.to_string(), "ip": ip })
}

/// Returns the argument when it is present and not blank.
pub fn required<'a>(arg: &'a Option<String>) -> Option<&'a str> {
    arg.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ips() {
        assert_eq!(split_ips(" 10.0.0.1, ,10.0.0.2,"), ["10.0.0.1", "10.0.0.2"]);
        assert!(split_ips(",,").is_empty());
    }

    #[test]
    fn test_parse_addresses_skips_invalid() {
        let addrs = parse_addresses(&["10.0.0.1", "nope", "10.0.0.2:9999"]);
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[1].port, Some(9999));
    }

    #[test]
    fn test_device_error_shape() {
        let value = device_error("10.0.0.1", "timed out");
        assert_eq!(value, json!({ "error": "timed out", "ip": "10.0.0.1" }));
    }

    #[test]
    fn test_required() {
        assert_eq!(required(&Some(" 10.0.0.1 ".into())), Some("10.0.0.1"));
        assert_eq!(required(&Some("  ".into())), None);
        assert_eq!(required(&None), None);
    }
}
