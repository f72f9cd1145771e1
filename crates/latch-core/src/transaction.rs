use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;

/// Globally unique, coarsely time-ordered transaction id.
///
/// Layout: `millis * 1_000_000 + node * 1_000 + suffix`, suffix in `[0, 1000)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnId(i64);

impl TxnId {
    /// Distinct suffixes available per node per millisecond.
    pub const SUFFIX_SPACE: i64 = 1000;

    pub fn compose(millis: i64, node_id: NodeId, suffix: u16) -> Self {
        Self(
            millis * 1_000_000
                + i64::from(node_id.as_u16()) * Self::SUFFIX_SPACE
                + i64::from(suffix) % Self::SUFFIX_SPACE,
        )
    }

    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Millisecond component.
    pub fn millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    /// Node component.
    pub fn node_id(&self) -> Option<NodeId> {
        NodeId::new(((self.0 / Self::SUFFIX_SPACE) % 1000) as u16).ok()
    }

    pub fn suffix(&self) -> u16 {
        (self.0 % Self::SUFFIX_SPACE) as u16
    }

    pub fn from_str(s: &str) -> Option<Self> {
        s.parse::<i64>().ok().map(Self)
    }
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of write a transaction covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxnOp {
    Update,
    Delete,
}

impl TxnOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// An in-flight write recorded for crash recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txn_id: TxnId,
    /// Milliseconds since the epoch when the write started.
    pub timestamp: i64,
    pub object_id: String,
    pub op: TxnOp,
    #[serde(default)]
    pub need_to_replicate: bool,
}

impl Transaction {
    pub fn new(txn_id: TxnId, timestamp: i64, object_id: impl Into<String>, op: TxnOp) -> Self {
        Self {
            txn_id,
            timestamp,
            object_id: object_id.into(),
            op,
            need_to_replicate: false,
        }
    }

    pub fn with_replication(mut self, need_to_replicate: bool) -> Self {
        self.need_to_replicate = need_to_replicate;
        self
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
