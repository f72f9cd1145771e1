use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LatchError, Result};

/// Small integer identity held by one live node at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u16);

impl NodeId {
    /// Exclusive upper bound of the id space.
    pub const MAX: u16 = 1000;

    /// Create a node id, rejecting values outside `[0, MAX)`.
    pub fn new(id: u16) -> Result<Self> {
        if id >= Self::MAX {
            return Err(LatchError::CapacityExceeded(format!(
                "node id {} is outside [0, {})",
                id,
                Self::MAX
            )));
        }
        Ok(Self(id))
    }

    /// Get the raw value.
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Parse from the decimal form used in store keys.
    pub fn from_str(s: &str) -> Option<Self> {
        s.parse::<u16>().ok().and_then(|id| Self::new(id).ok())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload written under a node's ephemeral membership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub node_id: NodeId,
    pub hostname: String,
    pub can_be_leader: bool,
    pub started_at: DateTime<Utc>,
}

impl MemberInfo {
    pub fn new(node_id: NodeId, hostname: impl Into<String>, can_be_leader: bool) -> Self {
        Self {
            node_id,
            hostname: hostname.into(),
            can_be_leader,
            started_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_bounds() {
        assert!(NodeId::new(0).is_ok());
        assert!(NodeId::new(999).is_ok());
        assert!(matches!(
            NodeId::new(1000),
            Err(LatchError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_node_id_parse() {
        assert_eq!(NodeId::from_str("7"), NodeId::new(7).ok());
        assert_eq!(NodeId::from_str("1000"), None);
        assert_eq!(NodeId::from_str("seven"), None);
        assert_eq!(NodeId::new(42).unwrap().to_string(), "42");
    }

    #[test]
    fn test_member_info_json() {
        let info = MemberInfo::new(NodeId::new(3).unwrap(), "host-a", true);
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"node_id\":3"));
        let back: MemberInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
