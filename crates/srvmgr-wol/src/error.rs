use thiserror::Error;

/// Errors raised by the Wake-on-LAN and device subsystem.
#[derive(Debug, Error)]
pub enum WolError {
    /// The MAC address does not resolve to exactly six octets.
    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    /// Not an IPv4/IPv6 address or an IPv4 CIDR block.
    #[error("Invalid IP address or CIDR: {0}")]
    InvalidAddress(String),

    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),

    /// A required device field is missing or empty.
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    #[error("Device not found: {id}")]
    DeviceNotFound { id: String },

    /// The network stack refused the packet (no route, socket error, …).
    #[error("Failed to send magic packet: {0}")]
    Send(#[source] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, WolError>;
