//! Announcer configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ack_manager::RetryPolicy;
use crate::codec::{MAX_DATAGRAM_SIZE, MIN_PACKET_SIZE};
use crate::errors::{RecsyncError, Result};
use crate::transport::canonical_addr;

/// Announcer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnouncerConfig {
    /// Receiver targets as `host:port`
    #[serde(default)]
    pub receivers: Vec<String>,

    /// Local socket address (default: 0.0.0.0:0)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Period of the announce cycle in milliseconds
    #[serde(default = "default_announce_interval")]
    pub announce_interval_ms: u64,

    /// ACK wait after the first send, in milliseconds
    #[serde(default = "default_base_timeout")]
    pub base_timeout_ms: u64,

    /// Growth factor of successive ACK waits
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Cap on any single ACK wait, in milliseconds
    #[serde(default = "default_max_retry_interval")]
    pub max_retry_interval_ms: u64,

    /// Sends per packet before it is reported failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fragmentation threshold in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Depth of the inbound acknowledgment queue
    #[serde(default = "default_inbound_queue_depth")]
    pub inbound_queue_depth: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0:0".to_string()
}

fn default_announce_interval() -> u64 {
    crate::ANNOUNCE_INTERVAL_MS
}

fn default_base_timeout() -> u64 {
    crate::ACK_TIMEOUT_MS
}

fn default_backoff_multiplier() -> f64 {
    crate::BACKOFF_MULTIPLIER
}

fn default_max_retry_interval() -> u64 {
    crate::MAX_RETRY_INTERVAL_MS
}

fn default_max_attempts() -> u32 {
    crate::MAX_ANNOUNCE_ATTEMPTS
}

fn default_max_packet_size() -> usize {
    crate::MAX_PACKET_SIZE
}

fn default_event_capacity() -> usize {
    256
}

fn default_inbound_queue_depth() -> usize {
    64
}

impl Default for AnnouncerConfig {
    fn default() -> Self {
        Self {
            receivers: Vec::new(),
            bind_address: default_bind_address(),
            announce_interval_ms: default_announce_interval(),
            base_timeout_ms: default_base_timeout(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_interval_ms: default_max_retry_interval(),
            max_attempts: default_max_attempts(),
            max_packet_size: default_max_packet_size(),
            event_capacity: default_event_capacity(),
            inbound_queue_depth: default_inbound_queue_depth(),
        }
    }
}

impl AnnouncerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RecsyncError::Config(format!("cannot read {}: {}", path.display(), e)))?;

        serde_json::from_str(&content)
            .map_err(|e| RecsyncError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| RecsyncError::Config(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| RecsyncError::Config(format!("cannot write {}: {}", path.display(), e)))
    }

    /// Add a receiver target
    pub fn with_receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receivers.push(receiver.into());
        self
    }

    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set base timeout, multiplier and cap in one go
    pub fn with_backoff(mut self, base: Duration, multiplier: f64, max: Duration) -> Self {
        self.base_timeout_ms = base.as_millis() as u64;
        self.backoff_multiplier = multiplier;
        self.max_retry_interval_ms = max.as_millis() as u64;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout_ms)
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_millis(self.max_retry_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_timeout: self.base_timeout(),
            backoff_multiplier: self.backoff_multiplier,
            max_retry_interval: self.max_retry_interval(),
            max_attempts: self.max_attempts,
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.receivers.is_empty() {
            return Err(RecsyncError::Config("at least one receiver is required".into()));
        }
        self.validate_tuning()
    }

    /// Validate everything except the receiver list.
    pub fn validate_tuning(&self) -> Result<()> {
        if self.announce_interval_ms == 0 {
            return Err(RecsyncError::Config("announce_interval_ms cannot be 0".into()));
        }
        if self.base_timeout_ms == 0 {
            return Err(RecsyncError::Config("base_timeout_ms cannot be 0".into()));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(RecsyncError::Config("backoff_multiplier must be a finite value of at least 1".into()));
        }
        if self.max_retry_interval_ms < self.base_timeout_ms {
            return Err(RecsyncError::Config(
                "max_retry_interval_ms cannot be below base_timeout_ms".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(RecsyncError::Config("max_attempts cannot be 0".into()));
        }
        if !(MIN_PACKET_SIZE..=MAX_DATAGRAM_SIZE).contains(&self.max_packet_size) {
            return Err(RecsyncError::Config(format!(
                "max_packet_size must be within {}..={}",
                MIN_PACKET_SIZE, MAX_DATAGRAM_SIZE
            )));
        }
        if self.event_capacity == 0 || self.inbound_queue_depth == 0 {
            return Err(RecsyncError::Config("channel capacities cannot be 0".into()));
        }
        Ok(())
    }

    /// Resolve every receiver to a socket address.
    ///
    /// Each `host:port` entry contributes its first resolved address;
    /// duplicates are dropped. IPv4-mapped addresses are stored in plain
    /// IPv4 form.
    pub async fn resolve_receivers(&self) -> Result<Vec<SocketAddr>> {
        self.resolve(None).await
    }

    /// Like [`resolve_receivers`](Self::resolve_receivers), but only picks
    /// addresses a socket bound at `local` can reach. An IPv4 socket needs
    /// IPv4 targets; an IPv6 socket reaches both families.
    pub async fn resolve_receivers_for(&self, local: SocketAddr) -> Result<Vec<SocketAddr>> {
        self.resolve(Some(local)).await
    }

    async fn resolve(&self, local: Option<SocketAddr>) -> Result<Vec<SocketAddr>> {
        let ipv4_only = local.is_some_and(|addr| addr.is_ipv4());
        let mut resolved = Vec::with_capacity(self.receivers.len());
        for receiver in &self.receivers {
            let addr = tokio::net::lookup_host(receiver.as_str())
                .await
                .map_err(|e| RecsyncError::Config(format!("cannot resolve receiver {}: {}", receiver, e)))?
                .map(canonical_addr)
                .find(|addr| !ipv4_only || addr.is_ipv4())
                .ok_or_else(|| RecsyncError::Config(format!("receiver {} has no usable address", receiver)))?;
            if !resolved.contains(&addr) {
                resolved.push(addr);
            }
        }
        Ok(resolved)
    }
}
