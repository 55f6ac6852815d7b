//! Broadcast target resolution.
//!
//! A wake request names its target in one of three ways: nothing (limited
//! broadcast), an address, or a CIDR block whose directed broadcast address
//! is used. Devices with a stored address get the broadcast of their subnet.

use std::net::{IpAddr, Ipv4Addr};

use crate::error::{Result, WolError};

/// `255.255.255.255`, used when no target is known.
pub const LIMITED_BROADCAST: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Prefix assumed for a device address stored without one.
const DEFAULT_DEVICE_PREFIX: u8 = 24;

/// Directed broadcast address of `ip/prefix`.
pub fn subnet_broadcast(ip: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    let host_bits = 32 - u32::from(prefix.min(32));
    let mask = if host_bits == 32 { 0 } else { u32::MAX << host_bits };
    Ipv4Addr::from(u32::from(ip) | !mask)
}

/// Parse `a.b.c.d/n` into its broadcast address.
pub fn cidr_broadcast(cidr: &str) -> Result<Ipv4Addr> {
    let invalid = || WolError::InvalidAddress(cidr.to_string());
    let (addr, prefix) = cidr.trim().split_once('/').ok_or_else(invalid)?;
    let ip: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }
    Ok(subnet_broadcast(ip, prefix))
}

/// Resolve an explicit target: an IP is used verbatim, a CIDR block
/// becomes its broadcast address.
pub fn parse_target(target: &str) -> Result<IpAddr> {
    let target = target.trim();
    if target.contains('/') {
        return cidr_broadcast(target).map(IpAddr::V4);
    }
    target
        .parse()
        .map_err(|_| WolError::InvalidAddress(target.to_string()))
}

/// Broadcast address for a device's stored `ip_address`.
///
/// CIDR gives its own broadcast, a bare IPv4 address its /24 broadcast.
/// Returns `None` for anything else (including IPv6) so the caller falls
/// back to its default target.
pub fn device_broadcast(ip_address: &str) -> Option<Ipv4Addr> {
    let ip_address = ip_address.trim();
    if ip_address.contains('/') {
        return cidr_broadcast(ip_address).ok();
    }
    ip_address
        .parse::<Ipv4Addr>()
        .ok()
        .map(|ip| subnet_broadcast(ip, DEFAULT_DEVICE_PREFIX))
}

/// Check that `value` is an IP address or IPv4 CIDR block.
pub fn validate_ip_or_cidr(value: &str) -> Result<()> {
    if value.contains('/') {
        cidr_broadcast(value).map(|_| ())
    } else {
        value
            .trim()
            .parse::<IpAddr>()
            .map(|_| ())
            .map_err(|_| WolError::InvalidAddress(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_becomes_network_broadcast() {
        assert_eq!(cidr_broadcast("192.168.1.0/24").unwrap(), Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(cidr_broadcast("10.0.0.7/8").unwrap(), Ipv4Addr::new(10, 255, 255, 255));
        assert_eq!(cidr_broadcast("172.16.5.4/32").unwrap(), Ipv4Addr::new(172, 16, 5, 4));
        assert_eq!(cidr_broadcast("1.2.3.4/0").unwrap(), LIMITED_BROADCAST);
    }

    #[test]
    fn bad_cidr_is_rejected() {
        for input in ["192.168.1.0/33", "192.168.1/24", "host/24", "10.0.0.1/"] {
            assert!(cidr_broadcast(input).is_err(), "{input}");
        }
    }

    #[test]
    fn plain_device_address_uses_slash_24() {
        assert_eq!(device_broadcast("192.168.50.20"), Some(Ipv4Addr::new(192, 168, 50, 255)));
        assert_eq!(device_broadcast("10.1.0.0/16"), Some(Ipv4Addr::new(10, 1, 255, 255)));
        assert_eq!(device_broadcast("fe80::1"), None);
        assert_eq!(device_broadcast("nas.local"), None);
    }

    #[test]
    fn explicit_target_ip_is_verbatim() {
        assert_eq!(parse_target("192.168.1.20").unwrap(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(parse_target("192.168.1.0/24").unwrap(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(parse_target("not-an-ip").is_err());
    }
}
