//! Core data structures for record announcement
//!
//! Records and properties are plain owned data; wire framing lives in
//! [`crate::codec`]. Property lists keep insertion order so repeated encoding
//! of the same record set is byte-for-byte deterministic.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::errors::{RecsyncError, Result};

/// Ordered key/value metadata with unique keys
///
/// Serialized as a JSON object; deserializing sorts by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct Properties(Vec<(String, String)>);

impl Properties {
    /// Create an empty property list
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a property, replacing the value of an existing key in place
    ///
    /// Returns the previous value if the key was present.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.0.push((key, value));
                None
            }
        }
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Properties::new();
        for (k, v) in iter {
            props.insert(k, v);
        }
        props
    }
}

impl From<BTreeMap<String, String>> for Properties {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map.into_iter().collect())
    }
}

impl From<Properties> for BTreeMap<String, String> {
    fn from(props: Properties) -> Self {
        props.0.into_iter().collect()
    }
}

/// Properties describing the announcing process as a whole
pub type GlobalProperties = Properties;

/// Record - a named, typed data point to be announced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Process-unique record name (e.g. `"DEV:AI:1"`)
    pub name: String,

    /// Record type tag understood by receivers (e.g. `"ai"`, `"longin"`)
    #[serde(rename = "type")]
    pub record_type: String,

    /// Optional secondary name
    #[serde(default)]
    pub alias: Option<String>,

    /// Record-local metadata
    #[serde(default)]
    pub properties: Properties,
}

impl Record {
    /// Create a record with no alias and no properties
    pub fn new(name: impl Into<String>, record_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            record_type: record_type.into(),
            alias: None,
            properties: Properties::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Check the record-level invariants
    ///
    /// # Errors
    /// Returns `RecsyncError::InvalidRecord` if the name or type is empty, or
    /// if an alias is present but empty.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RecsyncError::InvalidRecord("record name is empty".to_string()));
        }
        if self.record_type.is_empty() {
            return Err(RecsyncError::InvalidRecord(format!(
                "record {} has an empty type",
                self.name
            )));
        }
        if matches!(self.alias.as_deref(), Some("")) {
            return Err(RecsyncError::InvalidRecord(format!(
                "record {} has an empty alias",
                self.name
            )));
        }
        Ok(())
    }
}

/// Index of a record within the registry, in registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub usize);

/// Index of a configured receiver target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub usize);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-(target, record) announcement state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncementState {
    /// Not yet sent, or the last packet carrying it failed
    Pending,
    /// Carried by an unacknowledged packet
    InFlight { sequence: u32 },
    /// Acknowledged by the target
    Acked,
}

/// A configured receiver address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverTarget {
    pub address: SocketAddr,
    /// Sequence number of the most recent acknowledgment accepted from this target
    pub last_seen_ack_sequence: Option<u32>,
}

impl ReceiverTarget {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            last_seen_ack_sequence: None,
        }
    }
}

/// Acknowledgment status reported by a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    Ok = 0,
    Rejected = 1,
}

impl TryFrom<u8> for AckStatus {
    type Error = RecsyncError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(AckStatus::Ok),
            1 => Ok(AckStatus::Rejected),
            other => Err(RecsyncError::MalformedPacket(format!(
                "unknown acknowledgment status {}",
                other
            ))),
        }
    }
}

/// ACK/reject datagram sent by a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgment {
    pub sequence: u32,
    pub status: AckStatus,
}

impl Acknowledgment {
    /// Create a positive acknowledgment
    pub fn ok(sequence: u32) -> Self {
        Self {
            sequence,
            status: AckStatus::Ok,
        }
    }

    /// Create a rejection
    pub fn rejected(sequence: u32) -> Self {
        Self {
            sequence,
            status: AckStatus::Rejected,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok
    }
}

/// A decoded announcement packet, as seen by a receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub sequence: u32,
    /// More packets of the same batch follow
    pub continuation: bool,
    pub records: Vec<Record>,
    pub global_properties: GlobalProperties,
}

/// Observable outcome of the announcement pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// A packet was handed to the transport (`attempt` is 1 for the first send)
    Sent {
        target: SocketAddr,
        sequence: u32,
        attempt: u32,
        records: usize,
    },
    /// A packet was acknowledged; the listed records are now acked for `target`
    Acknowledged {
        target: SocketAddr,
        sequence: u32,
        records: Vec<String>,
    },
    /// A packet failed terminally; its records are pending again
    Failed { error: RecsyncError },
}
