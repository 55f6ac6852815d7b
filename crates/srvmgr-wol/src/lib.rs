//! `srvmgr-wol`: Wake-on-LAN and device reachability.
//!
//! - [`packet::WakePacketSender`] builds the magic packet and broadcasts it.
//! - [`store::DeviceStore`] persists the device inventory.
//! - [`probe::ReachabilityProbe`] implementations answer "does this host
//!   respond right now", and [`monitor::ReachabilityMonitor`] turns those
//!   noisy answers into a stable per-device state.

pub mod db;
pub mod device;
pub mod error;
pub mod mac;
pub mod monitor;
pub mod packet;
pub mod probe;
pub mod store;
pub mod target;

pub use device::{Device, DeviceUpdate, NewDevice};
pub use error::{Result, WolError};
pub use mac::{normalize_mac, MacAddress};
pub use monitor::{ReachabilityMonitor, ReachabilityRecord, ReachabilityState};
pub use packet::{magic_packet, WakePacketSender, WakeReport, MAGIC_PACKET_LEN};
pub use probe::{PingProbe, ProbeOutcome, ReachabilityProbe, TcpProbe};
pub use store::DeviceStore;
