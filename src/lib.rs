//! Reccaster - record announcer for IOC-side record synchronization
//!
//! Announces a set of named, typed records with their properties to one or
//! more receivers over UDP and keeps announcing until each receiver has
//! acknowledged every record.
//!
//! # Design Principles
//! - One event loop owns all mutable state; no locks on the hot path
//! - Per-receiver delivery state, so a dead receiver never blocks a live one
//! - Truncated exponential backoff with a bounded number of sends per packet
//! - Checksummed, versioned, big-endian wire format

pub mod errors;
pub mod contracts;
pub mod codec;
pub mod registry;
pub mod transport;
pub mod receiver;
pub mod ack_manager;
pub mod config;
pub mod scheduler;

pub use config::AnnouncerConfig;
pub use contracts::{
    AnnounceEvent, AnnouncementState, GlobalProperties, Properties, Record, RecordId, TargetId,
};
pub use errors::{RecsyncError, Result};
pub use registry::RecordRegistry;
pub use scheduler::{Announcer, AnnouncerHandle};
pub use transport::{Transport, UdpTransport};

/// Protocol version carried in every datagram
pub const PROTOCOL_VERSION: u8 = 1;

/// Default fragmentation threshold (in bytes) - fits a standard Ethernet MTU
pub const MAX_PACKET_SIZE: usize = 1400;

/// ACK wait after the first send, in milliseconds
pub const ACK_TIMEOUT_MS: u64 = 250;

/// Sends per packet before delivery is reported failed
pub const MAX_ANNOUNCE_ATTEMPTS: u32 = 5;

/// Backoff multiplier for retransmission (exponential)
pub const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Cap on a single ACK wait, in milliseconds
pub const MAX_RETRY_INTERVAL_MS: u64 = 5_000;

/// Period of the announce cycle, in milliseconds
pub const ANNOUNCE_INTERVAL_MS: u64 = 15_000;
