mod cluster;
mod coordination;
mod observability;

pub use cluster::{ClusterConfig, StoreBackend};
pub use coordination::{LeadershipConfig, ReprocessingConfig, SignalConfig, SignalTransport};
pub use observability::{LoggingConfig, ObservabilityConfig};

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{LatchError, Result};

/// Root configuration for a latch node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatchConfig {
    /// Node identity configuration.
    #[serde(default)]
    pub node: NodeConfig,

    /// Coordination backend configuration.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Leader election configuration.
    #[serde(default)]
    pub leadership: LeadershipConfig,

    /// Reprocessing queue configuration. Absent means no queue.
    #[serde(default)]
    pub reprocessing: Option<ReprocessingConfig>,

    /// Signal broadcast configuration.
    #[serde(default)]
    pub signals: SignalConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl LatchConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| LatchError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content);

        let config: Self = toml::from_str(&content)
            .map_err(|e| LatchError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a single process backed by the in-memory store.
    pub fn in_memory() -> Self {
        Self {
            cluster: ClusterConfig {
                backend: StoreBackend::Memory,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = self.node.id {
            if id >= crate::cluster::NodeId::MAX {
                return Err(LatchError::Config(format!(
                    "node.id must be below {}, got {}",
                    crate::cluster::NodeId::MAX,
                    id
                )));
            }
        }
        if self.cluster.backend == StoreBackend::Postgres && self.cluster.url.is_empty() {
            return Err(LatchError::Config(
                "cluster.url is required for the postgres backend".to_string(),
            ));
        }
        if self.cluster.namespace.is_empty()
            || self.cluster.namespace.contains(['/', ':'])
        {
            return Err(LatchError::Config(format!(
                "cluster.namespace must be a single non-empty path segment, got '{}'",
                self.cluster.namespace
            )));
        }
        Ok(())
    }

    /// Whether a reprocessing queue is configured and enabled.
    pub fn reprocessing_enabled(&self) -> bool {
        self.reprocessing.as_ref().map(|r| r.enabled).unwrap_or(false)
    }

    /// The signal transport in effect once defaults are resolved.
    pub fn signal_transport(&self) -> SignalTransport {
        match self.signals.transport {
            Some(transport) => transport,
            None if self.reprocessing_enabled() => SignalTransport::Log,
            None => SignalTransport::Store,
        }
    }
}

/// Node identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Fixed node id. Allocated from the cluster counter when absent.
    #[serde(default)]
    pub id: Option<u16>,

    /// Whether this node takes part in leader election.
    #[serde(default = "default_true")]
    pub can_be_leader: bool,

    /// Read-only nodes never write transactions.
    #[serde(default)]
    pub read_only: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            can_be_leader: true,
            read_only: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };

    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}
