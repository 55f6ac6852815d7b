//! Device model and input validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use srvmgr_core::DeviceId;

use crate::error::{Result, WolError};
use crate::mac::MacAddress;
use crate::target::validate_ip_or_cidr;

/// A wakeable machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// DNS or mDNS name (`nas.local`).
    pub hostname: Option<String>,
    /// IPv4/IPv6 address or IPv4 CIDR block.
    pub ip_address: Option<String>,
    pub mac_address: MacAddress,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Address shown to users: hostname, then IP without prefix, then "unknown".
    pub fn display_address(&self) -> String {
        self.probe_target().unwrap_or_else(|| "unknown".to_string())
    }

    /// Address handed to a reachability probe.
    pub fn probe_target(&self) -> Option<String> {
        if let Some(host) = self.hostname.as_deref() {
            return Some(host.to_string());
        }
        self.ip_address
            .as_deref()
            .map(|ip| ip.split('/').next().unwrap_or(ip).to_string())
    }

    pub fn is_mdns_hostname(&self) -> bool {
        self.hostname.as_deref().is_some_and(is_mdns_hostname)
    }
}

/// True for names in the `.local` / `.lan` zones.
pub fn is_mdns_hostname(hostname: &str) -> bool {
    let lower = hostname.trim().trim_end_matches('.').to_ascii_lowercase();
    lower.ends_with(".local") || lower.ends_with(".lan")
}

/// Input for creating a device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDevice {
    pub name: String,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub mac_address: String,
    pub description: Option<String>,
}

/// Partial update. `Some("")` clears an optional field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub description: Option<String>,
}

/// Fields of a device after trimming and validation.
#[derive(Debug, Clone)]
pub(crate) struct ValidDevice {
    pub name: String,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub mac_address: MacAddress,
    pub description: Option<String>,
}

impl NewDevice {
    pub(crate) fn validate(&self) -> Result<ValidDevice> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(WolError::InvalidDevice("name is required".into()));
        }
        Ok(ValidDevice {
            name: name.to_string(),
            hostname: validate_hostname(self.hostname.as_deref())?,
            ip_address: validate_ip(self.ip_address.as_deref())?,
            mac_address: MacAddress::parse(&self.mac_address)?,
            description: non_empty(self.description.as_deref()),
        })
    }
}

impl DeviceUpdate {
    /// Merge onto `device` and validate the result.
    pub(crate) fn apply(&self, device: &Device) -> Result<ValidDevice> {
        let merged = NewDevice {
            name: self.name.clone().unwrap_or_else(|| device.name.clone()),
            hostname: self.hostname.clone().or_else(|| device.hostname.clone()),
            ip_address: self.ip_address.clone().or_else(|| device.ip_address.clone()),
            mac_address: self
                .mac_address
                .clone()
                .unwrap_or_else(|| device.mac_address.to_string()),
            description: self.description.clone().or_else(|| device.description.clone()),
        };
        merged.validate()
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn validate_hostname(value: Option<&str>) -> Result<Option<String>> {
    let Some(host) = non_empty(value) else {
        return Ok(None);
    };
    let valid = host.len() <= 253
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if !valid {
        return Err(WolError::InvalidHostname(host));
    }
    Ok(Some(host))
}

fn validate_ip(value: Option<&str>) -> Result<Option<String>> {
    let Some(ip) = non_empty(value) else {
        return Ok(None);
    };
    validate_ip_or_cidr(&ip)?;
    Ok(Some(ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(hostname: Option<&str>, ip: Option<&str>) -> Device {
        Device {
            id: DeviceId::new(),
            name: "nas".into(),
            hostname: hostname.map(String::from),
            ip_address: ip.map(String::from),
            mac_address: MacAddress::new([1, 2, 3, 4, 5, 6]),
            description: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn display_address_prefers_hostname_then_ip() {
        assert_eq!(device(Some("nas.local"), Some("10.0.0.5")).display_address(), "nas.local");
        assert_eq!(device(None, Some("10.0.0.5/24")).display_address(), "10.0.0.5");
        assert_eq!(device(None, None).display_address(), "unknown");
        assert_eq!(device(None, None).probe_target(), None);
    }

    #[test]
    fn mdns_suffixes() {
        assert!(is_mdns_hostname("printer.local"));
        assert!(is_mdns_hostname("NAS.LAN"));
        assert!(is_mdns_hostname("box.local."));
        assert!(!is_mdns_hostname("example.com"));
        assert!(!is_mdns_hostname("local"));
        assert!(device(Some("pi.lan"), None).is_mdns_hostname());
    }

    #[test]
    fn validation_normalizes_and_trims() {
        let valid = NewDevice {
            name: "  desktop ".into(),
            hostname: Some("".into()),
            ip_address: Some(" 192.168.1.10 ".into()),
            mac_address: "aa-bb-cc-dd-ee-ff".into(),
            description: Some("   ".into()),
        }
        .validate()
        .unwrap();
        assert_eq!(valid.name, "desktop");
        assert_eq!(valid.hostname, None);
        assert_eq!(valid.ip_address.as_deref(), Some("192.168.1.10"));
        assert_eq!(valid.mac_address.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(valid.description, None);
    }

    #[test]
    fn validation_rejects_bad_fields() {
        let base = NewDevice {
            name: "x".into(),
            mac_address: "AA:BB:CC:DD:EE:FF".into(),
            ..Default::default()
        };
        assert!(matches!(
            NewDevice { name: " ".into(), ..base.clone() }.validate(),
            Err(WolError::InvalidDevice(_))
        ));
        assert!(matches!(
            NewDevice { mac_address: "nope".into(), ..base.clone() }.validate(),
            Err(WolError::InvalidMac(_))
        ));
        assert!(matches!(
            NewDevice { ip_address: Some("300.1.1.1".into()), ..base.clone() }.validate(),
            Err(WolError::InvalidAddress(_))
        ));
        assert!(matches!(
            NewDevice { hostname: Some("bad host!".into()), ..base }.validate(),
            Err(WolError::InvalidHostname(_))
        ));
    }
}
