use serde::{Deserialize, Serialize};

/// Coordination backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Which backend holds coordination state.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection endpoint (PostgreSQL URL for the postgres backend).
    #[serde(default)]
    pub url: String,

    /// Prefix applied to every key, isolating one cluster from another.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Pool checkout timeout in seconds.
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout_secs: u64,

    /// Session heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Sessions silent for longer than this are expired (in seconds).
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: String::new(),
            namespace: default_namespace(),
            pool_size: default_pool_size(),
            pool_timeout_secs: default_pool_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            session_timeout_secs: default_session_timeout(),
        }
    }
}

fn default_namespace() -> String {
    "latch".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_pool_timeout() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    2
}

fn default_session_timeout() -> u64 {
    15
}

/// Coordination backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; one node only.
    #[default]
    Memory,

    /// PostgreSQL tables shared by every node.
    Postgres,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cluster_config() {
        let config = ClusterConfig::default();
        assert_eq!(config.namespace, "latch");
        assert_eq!(config.backend, StoreBackend::Memory);
        assert_eq!(config.heartbeat_interval_secs, 2);
        assert_eq!(config.session_timeout_secs, 15);
    }

    #[test]
    fn test_parse_cluster_config() {
        let toml = r#"
            backend = "postgres"
            url = "postgres://db/latch"
            session_timeout_secs = 30
        "#;

        let config: ClusterConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.backend, StoreBackend::Postgres);
        assert_eq!(config.session_timeout_secs, 30);
        assert_eq!(config.pool_size, 10);
    }
}
