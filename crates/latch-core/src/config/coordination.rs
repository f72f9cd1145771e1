use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Leader election configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadershipConfig {
    /// Delay between a membership change and the leader's callback.
    #[serde(default = "default_debounce")]
    pub debounce_secs: u64,

    /// Pause between checks while waiting for a leader.
    #[serde(default = "default_election_poll_interval")]
    pub election_poll_interval_ms: u64,

    /// Checks made while waiting for a leader before giving up.
    #[serde(default = "default_election_poll_attempts")]
    pub election_poll_attempts: u32,
}

impl LeadershipConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn election_poll_interval(&self) -> Duration {
        Duration::from_millis(self.election_poll_interval_ms)
    }
}

impl Default for LeadershipConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce(),
            election_poll_interval_ms: default_election_poll_interval(),
            election_poll_attempts: default_election_poll_attempts(),
        }
    }
}

fn default_debounce() -> u64 {
    10
}

fn default_election_poll_interval() -> u64 {
    200
}

fn default_election_poll_attempts() -> u32 {
    25
}

/// Reprocessing queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReprocessingConfig {
    /// Whether the queue runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log topic holding reprocessing records.
    #[serde(default = "default_reprocessing_topic")]
    pub topic: String,

    /// Consumer group shared by every node.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Minimum record age before replay, in milliseconds.
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,

    /// Interval between log polls in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Interval between flushes of the in-memory fallback buffer, in seconds.
    #[serde(default = "default_fallback_interval")]
    pub fallback_retry_interval_secs: u64,

    /// Producer tuning passed through to the log backend.
    #[serde(default)]
    pub producer_config: HashMap<String, String>,

    /// Consumer tuning passed through to the log backend.
    #[serde(default)]
    pub consumer_config: HashMap<String, String>,
}

impl ReprocessingConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn fallback_retry_interval(&self) -> Duration {
        Duration::from_secs(self.fallback_retry_interval_secs)
    }
}

impl Default for ReprocessingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: default_reprocessing_topic(),
            consumer_group: default_consumer_group(),
            grace_period_ms: default_grace_period(),
            poll_interval_secs: default_poll_interval(),
            fallback_retry_interval_secs: default_fallback_interval(),
            producer_config: HashMap::new(),
            consumer_config: HashMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_reprocessing_topic() -> String {
    "LatchReprocessing".to_string()
}

fn default_consumer_group() -> String {
    "latch-reprocessing-consumer".to_string()
}

fn default_grace_period() -> u64 {
    120_000
}

fn default_poll_interval() -> u64 {
    60
}

fn default_fallback_interval() -> u64 {
    60
}

/// Signal broadcast configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Transport for signals. Derived from the reprocessing setup when unset.
    #[serde(default)]
    pub transport: Option<SignalTransport>,

    /// Log topic used by the log transport.
    #[serde(default = "default_signal_topic")]
    pub topic: String,

    /// Delay before retrying a failed version refresh, in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl SignalConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            transport: None,
            topic: default_signal_topic(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

fn default_signal_topic() -> String {
    "LatchSignals".to_string()
}

fn default_retry_delay() -> u64 {
    300
}

/// How signals travel between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalTransport {
    /// Versioned records in the coordination store.
    Store,
    /// Messages on the durable log.
    Log,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leadership_defaults() {
        let config = LeadershipConfig::default();
        assert_eq!(config.debounce(), Duration::from_secs(10));
        assert_eq!(config.election_poll_interval(), Duration::from_millis(200));
        assert_eq!(config.election_poll_attempts, 25);
    }

    #[test]
    fn test_reprocessing_defaults() {
        let config = ReprocessingConfig::default();
        assert!(config.enabled);
        assert_eq!(config.grace_period(), Duration::from_millis(120_000));
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.fallback_retry_interval(), Duration::from_secs(60));
        assert_eq!(config.consumer_group, "latch-reprocessing-consumer");
    }

    #[test]
    fn test_signal_defaults() {
        let config = SignalConfig::default();
        assert!(config.transport.is_none());
        assert_eq!(config.retry_delay(), Duration::from_secs(300));
    }
}
