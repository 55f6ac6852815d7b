//! Wake-on-LAN magic packet and the UDP sender.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::Serialize;
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument, warn};

use srvmgr_core::config::{WolConfig, DEFAULT_WOL_PORT};

use crate::device::Device;
use crate::error::{Result, WolError};
use crate::mac::MacAddress;
use crate::target::{device_broadcast, parse_target, LIMITED_BROADCAST};

/// 6 sync bytes followed by the MAC repeated 16 times.
pub const MAGIC_PACKET_LEN: usize = 6 + 16 * 6;

/// Build the 102-byte magic packet for `mac`.
pub fn magic_packet(mac: &MacAddress) -> [u8; MAGIC_PACKET_LEN] {
    let mut packet = [0xFFu8; MAGIC_PACKET_LEN];
    let octets = mac.octets();
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&octets);
    }
    packet
}

/// What was handed to the network stack.
///
/// There is no acknowledgement in the protocol, so this only proves the
/// datagram left the socket.
#[derive(Debug, Clone, Serialize)]
pub struct WakeReport {
    pub mac: MacAddress,
    pub target: SocketAddr,
    pub bytes_sent: usize,
}

/// Sends magic packets over UDP with broadcast enabled.
#[derive(Debug, Clone)]
pub struct WakePacketSender {
    default_target: IpAddr,
    port: u16,
}

impl Default for WakePacketSender {
    fn default() -> Self {
        Self {
            default_target: IpAddr::V4(LIMITED_BROADCAST),
            port: DEFAULT_WOL_PORT,
        }
    }
}

impl WakePacketSender {
    pub fn new(default_target: IpAddr, port: u16) -> Self {
        Self {
            default_target,
            port,
        }
    }

    /// Build a sender from `[wol]` config. An unparsable `default_target`
    /// is a configuration error.
    pub fn from_config(config: &WolConfig) -> Result<Self> {
        let default_target = match config.default_target.as_deref() {
            Some(target) => parse_target(target)?,
            None => IpAddr::V4(LIMITED_BROADCAST),
        };
        Ok(Self::new(default_target, config.port))
    }

    pub fn default_port(&self) -> u16 {
        self.port
    }

    /// Send a magic packet for `mac` to `target` (IP or CIDR), or to the
    /// default target when none is given.
    #[instrument(skip(self), fields(mac = %mac))]
    pub async fn send(
        &self,
        mac: &str,
        target: Option<&str>,
        port: Option<u16>,
    ) -> Result<WakeReport> {
        let mac = MacAddress::parse(mac)?;
        let ip = match target {
            Some(t) if !t.trim().is_empty() => parse_target(t)?,
            _ => self.default_target,
        };
        self.send_to(mac, SocketAddr::new(ip, port.unwrap_or(self.port)))
            .await
    }

    /// Wake a stored device, aiming at the broadcast address of its subnet.
    #[instrument(skip(self, device), fields(device_id = %device.id, name = %device.name))]
    pub async fn wake_device(&self, device: &Device, port: Option<u16>) -> Result<WakeReport> {
        let ip = device
            .ip_address
            .as_deref()
            .and_then(device_broadcast)
            .map(IpAddr::V4)
            .unwrap_or(self.default_target);
        self.send_to(device.mac_address, SocketAddr::new(ip, port.unwrap_or(self.port)))
            .await
    }

    /// Transmit one packet to an already-resolved socket address.
    pub async fn send_to(&self, mac: MacAddress, target: SocketAddr) -> Result<WakeReport> {
        let bind: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await.map_err(WolError::Send)?;
        if target.is_ipv4() {
            socket.set_broadcast(true).map_err(WolError::Send)?;
        }

        let packet = magic_packet(&mac);
        let bytes_sent = socket.send_to(&packet, target).await.map_err(|e| {
            warn!(%mac, %target, error = %e, "magic packet send failed");
            WolError::Send(e)
        })?;
        if bytes_sent != MAGIC_PACKET_LEN {
            debug!(bytes_sent, "short datagram write");
        }

        info!(%mac, %target, "magic packet sent");
        Ok(WakeReport {
            mac,
            target,
            bytes_sent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_layout_is_sync_then_sixteen_repetitions() {
        let mac: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let packet = magic_packet(&mac);

        assert_eq!(packet.len(), 102);
        assert_eq!(&packet[..6], &[0xFF; 6]);
        for rep in packet[6..].chunks(6) {
            assert_eq!(rep, &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        }
        assert_eq!(packet[6..].chunks(6).count(), 16);
    }

    #[tokio::test]
    async fn invalid_mac_is_rejected_before_sending() {
        let sender = WakePacketSender::default();
        let err = sender.send("AA:BB:CC", None, None).await.unwrap_err();
        assert!(matches!(err, WolError::InvalidMac(_)));
    }

    #[tokio::test]
    async fn invalid_target_is_rejected() {
        let sender = WakePacketSender::default();
        let err = sender
            .send("AA:BB:CC:DD:EE:FF", Some("nowhere"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WolError::InvalidAddress(_)));

        let err = sender
            .send("AA:BB:CC:DD:EE:FF", Some("10.0.0.0/40"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WolError::InvalidAddress(_)));
    }

    #[test]
    fn config_default_target_must_parse() {
        let config = WolConfig {
            port: 7,
            default_target: Some("192.168.0.0/16".into()),
        };
        let sender = WakePacketSender::from_config(&config).unwrap();
        assert_eq!(sender.default_target, IpAddr::V4(Ipv4Addr::new(192, 168, 255, 255)));
        assert_eq!(sender.default_port(), 7);

        let bad = WolConfig {
            port: 9,
            default_target: Some("bogus".into()),
        };
        assert!(WakePacketSender::from_config(&bad).is_err());
    }
}
