use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;

/// Cluster-wide event telling every node to reload some cached state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    /// Design document or schemas changed.
    Design,
    /// Users, groups or ACLs changed.
    AuthChange,
    /// Cached scripts must be discarded.
    JavascriptClearCache,
}

impl Signal {
    pub const ALL: [Signal; 3] = [Self::Design, Self::AuthChange, Self::JavascriptClearCache];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Design => "DESIGN",
            Self::AuthChange => "AUTH_CHANGE",
            Self::JavascriptClearCache => "JAVASCRIPT_CLEAR_CACHE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DESIGN" => Some(Self::Design),
            "AUTH_CHANGE" => Some(Self::AuthChange),
            "JAVASCRIPT_CLEAR_CACHE" => Some(Self::JavascriptClearCache),
            _ => None,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A signal broadcast tagged with its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub signal: Signal,
    pub node_id: NodeId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names_round_trip() {
        for signal in Signal::ALL {
            assert_eq!(Signal::from_str(signal.as_str()), Some(signal));
        }
        assert_eq!(Signal::from_str("CACHE"), None);
    }

    #[test]
    fn test_signal_message_json() {
        let msg = SignalMessage {
            signal: Signal::AuthChange,
            node_id: NodeId::new(3).unwrap(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"signal":"AUTH_CHANGE","node_id":3}"#);
    }
}
