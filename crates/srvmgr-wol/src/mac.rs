//! MAC address parsing and canonical formatting.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, WolError};

/// A 48-bit hardware address.
///
/// Parsing accepts `:`, `-` or `.` separators (or none) in any case;
/// `Display` always renders the canonical `AA:BB:CC:DD:EE:FF` form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn parse(input: &str) -> Result<Self> {
        let digits: String = input
            .trim()
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect();

        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(WolError::InvalidMac(input.to_string()));
        }

        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|_| WolError::InvalidMac(input.to_string()))?;
        }
        Ok(Self(octets))
    }
}

/// Normalize any accepted spelling to `AA:BB:CC:DD:EE:FF`.
pub fn normalize_mac(input: &str) -> Result<String> {
    MacAddress::parse(input).map(|mac| mac.to_string())
}

impl FromStr for MacAddress {
    type Err = WolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_spellings() {
        for input in [
            "aa:bb:cc:dd:ee:ff",
            "AA-BB-CC-DD-EE-FF",
            "aabb.ccdd.eeff",
            "AABBCCDDEEFF",
            "  aa:bb:cc:dd:ee:ff  ",
        ] {
            assert_eq!(normalize_mac(input).unwrap(), "AA:BB:CC:DD:EE:FF", "{input}");
        }
    }

    #[test]
    fn rejects_wrong_length_and_non_hex() {
        for input in ["", "AA:BB:CC:DD:EE", "AA:BB:CC:DD:EE:FF:00", "GG:BB:CC:DD:EE:FF", "A:B:C:D:E:F"] {
            assert!(
                matches!(MacAddress::parse(input), Err(WolError::InvalidMac(_))),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn octets_match_display() {
        let mac: MacAddress = "01:23:45:67:89:ab".parse().unwrap();
        assert_eq!(mac.octets(), [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB]);
        assert_eq!(serde_json::to_string(&mac).unwrap(), r#""01:23:45:67:89:AB""#);
    }
}
