//! Error types for record announcement
//!
//! Covers every failure mode of the announcement pipeline:
//! - Local API misuse (duplicate records, mutation after start)
//! - Inbound decode failures
//! - Network I/O failures
//! - Terminal per-packet delivery failures

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for announcement operations
pub type Result<T> = std::result::Result<T, RecsyncError>;

/// Announcement error enumeration
///
/// `Clone` so failures can be carried inside broadcast events; I/O errors are
/// captured by message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecsyncError {
    /// A record with the same name is already registered
    #[error("Duplicate record: {0}")]
    DuplicateRecord(String),

    /// Record descriptor violates a data-model invariant
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Inbound datagram is truncated or internally inconsistent
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Send or receive failure on the datagram socket
    #[error("Transport error: {0}")]
    Transport(String),

    /// Receiver never acknowledged the packet
    #[error("Packet {sequence} to {target} unacknowledged after {attempts} attempts")]
    RetryExhausted {
        target: SocketAddr,
        sequence: u32,
        attempts: u32,
    },

    /// Receiver explicitly refused the packet
    #[error("Packet {sequence} rejected by {target}")]
    Rejected { target: SocketAddr, sequence: u32 },

    /// Setup mutation attempted after announcing has begun
    #[error("Announcer is already running")]
    AlreadyRunning,

    /// Encoded content cannot fit in a single packet
    #[error("Packet too large: required {required} bytes, available {available}")]
    PacketTooLarge { required: usize, available: usize },

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The run loop has already stopped
    #[error("Announcer has stopped")]
    Stopped,
}

impl From<io::Error> for RecsyncError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl RecsyncError {
    /// Whether this error is a terminal per-packet delivery failure
    pub fn is_delivery_failure(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. } | Self::Rejected { .. })
    }
}
