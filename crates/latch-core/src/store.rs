//! Backend capabilities the coordination algorithms are written against.
//!
//! A [`CoordinationStore`] is a linearizable, versioned key/value store with
//! session-scoped (ephemeral) records and change notification. A
//! [`DurableLog`] is a partitioned, append-only log with consumer-group
//! offsets. Keys are `/`-separated paths relative to the cluster namespace.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;

/// A stored value and its version. Versions start at 0 and grow by one per write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Health of the session between this process and the coordination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connected,
    /// Contact lost; the session may still be alive on the server.
    Suspended,
    /// Contact restored within the session timeout.
    Reconnected,
    /// The session expired; ephemeral records are gone.
    Lost,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Suspended => "suspended",
            Self::Reconnected => "reconnected",
            Self::Lost => "lost",
        }
    }

    /// Whether locks held through the store may no longer be enforced.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Suspended | Self::Lost)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable key/value records with versioned writes, compare-and-set,
/// watches and session-scoped records. One handle is one session.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Identifier of this session.
    fn session_id(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Create a persistent record. Fails with `AlreadyExists`.
    async fn create(&self, key: &str, value: &[u8]) -> Result<u64>;

    /// Create a record removed automatically when this session ends.
    async fn create_ephemeral(&self, key: &str, value: &[u8]) -> Result<u64>;

    /// Create or overwrite, returning the new version.
    async fn set(&self, key: &str, value: &[u8]) -> Result<u64>;

    /// Write only if the current version equals `expected` (`None` means the
    /// key must be absent). Returns the new version, or `None` on mismatch.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &[u8],
    ) -> Result<Option<u64>>;

    /// Delete, optionally only at a given version. Fails with `NotFound` or
    /// `VersionMismatch`.
    async fn delete(&self, key: &str, expected: Option<u64>) -> Result<()>;

    /// Names of the immediate children under `prefix`, sorted.
    async fn children(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read barrier: later reads under `prefix` observe every write that
    /// completed before this call.
    async fn sync(&self, prefix: &str) -> Result<()>;

    /// Follow the version of one key (`None` while absent). The receiver
    /// starts at the current version.
    async fn watch(&self, key: &str) -> Result<watch::Receiver<Option<u64>>>;

    /// Follow a counter bumped whenever a child of `prefix` is created or deleted.
    async fn watch_children(&self, prefix: &str) -> Result<watch::Receiver<u64>>;

    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// End the session, dropping its ephemeral records.
    async fn close(&self) -> Result<()>;
}

/// Where to start a consumer group that has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

/// Consumer tuning. Unknown properties are kept for the backend.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub reset: OffsetReset,
    pub max_poll_records: usize,
    pub properties: HashMap<String, String>,
}

impl ConsumerOptions {
    pub fn new(reset: OffsetReset) -> Self {
        Self {
            reset,
            max_poll_records: 500,
            properties: HashMap::new(),
        }
    }

    /// Apply pass-through properties; `max_poll_records` and
    /// `auto_offset_reset` are understood here.
    pub fn with_properties(mut self, properties: &HashMap<String, String>) -> Self {
        if let Some(n) = properties
            .get("max_poll_records")
            .and_then(|v| v.parse::<usize>().ok())
        {
            self.max_poll_records = n.max(1);
        }
        match properties.get("auto_offset_reset").map(String::as_str) {
            Some("earliest") => self.reset = OffsetReset::Earliest,
            Some("latest") => self.reset = OffsetReset::Latest,
            _ => {}
        }
        self.properties = properties.clone();
        self
    }
}

/// One record read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: u32,
    pub offset: u64,
    /// Append time in milliseconds since the epoch.
    pub timestamp: i64,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Position of an appended record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub partition: u32,
    pub offset: u64,
}

/// Append-only, partitioned, timestamped log.
#[async_trait]
pub trait DurableLog: Send + Sync {
    async fn append(&self, topic: &str, key: &str, payload: &[u8]) -> Result<LogPosition>;

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn LogConsumer>>;

    async fn close(&self) -> Result<()>;
}

/// A consumer-group member reading every partition of one topic.
#[async_trait]
pub trait LogConsumer: Send {
    /// Records after the current position, waiting up to `timeout` for some.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<LogRecord>>;

    /// Record that everything before `next_offset` is processed.
    async fn commit(&mut self, partition: u32, next_offset: u64) -> Result<()>;

    /// Move the read position; the next poll starts at `offset`.
    async fn seek(&mut self, partition: u32, offset: u64) -> Result<()>;

    async fn committed(&self, partition: u32) -> Result<Option<u64>>;

    async fn close(&mut self) -> Result<()>;
}

/// Join key segments with `/`, skipping empty ones.
pub fn key_join(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Parent of a key, `""` for top-level keys.
pub fn key_parent(key: &str) -> &str {
    match key.rfind('/') {
        Some(idx) => &key[..idx],
        None => "",
    }
}

/// Stable partition choice for a record key (FNV-1a).
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % partitions.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_join() {
        assert_eq!(key_join(&["txns", "open", "7"]), "txns/open/7");
        assert_eq!(key_join(&["/group/", "members"]), "group/members");
        assert_eq!(key_join(&["", "a"]), "a");
    }

    #[test]
    fn test_key_parent() {
        assert_eq!(key_parent("txns/open/7/123"), "txns/open/7");
        assert_eq!(key_parent("top"), "");
    }

    #[test]
    fn test_partition_is_stable() {
        let p = partition_for("obj-1", 8);
        assert_eq!(p, partition_for("obj-1", 8));
        assert!(p < 8);
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[test]
    fn test_consumer_options_properties() {
        let mut props = HashMap::new();
        props.insert("max_poll_records".to_string(), "25".to_string());
        props.insert("auto_offset_reset".to_string(), "latest".to_string());
        props.insert("fetch_min_bytes".to_string(), "1".to_string());

        let options = ConsumerOptions::new(OffsetReset::Earliest).with_properties(&props);
        assert_eq!(options.max_poll_records, 25);
        assert_eq!(options.reset, OffsetReset::Latest);
        assert_eq!(options.properties.len(), 3);
    }

    #[test]
    fn test_connection_state_errors() {
        assert!(ConnectionState::Suspended.is_error());
        assert!(ConnectionState::Lost.is_error());
        assert!(!ConnectionState::Reconnected.is_error());
    }
}
