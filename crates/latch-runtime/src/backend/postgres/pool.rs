use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use latch_core::config::ClusterConfig;
use latch_core::error::{LatchError, Result};

/// Connection pool shared by the PostgreSQL store and log.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect using the `[cluster]` settings.
    pub async fn from_config(config: &ClusterConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(LatchError::Config(
                "cluster.url is required for the postgres backend".to_string(),
            ));
        }
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| LatchError::Connectivity(format!("Failed to connect: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| LatchError::Connectivity(format!("Health check failed: {}", e)))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Classify a driver error: lost connections are transient.
pub(crate) fn db_err(e: sqlx::Error) -> LatchError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            LatchError::Connectivity(e.to_string())
        }
        other => LatchError::Sql(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_url_is_config_error() {
        let config = ClusterConfig::default();
        assert!(matches!(
            Database::from_config(&config).await,
            Err(LatchError::Config(_))
        ));
    }

    #[test]
    fn test_pool_errors_are_retryable() {
        assert!(db_err(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(matches!(
            db_err(sqlx::Error::RowNotFound),
            LatchError::Sql(_)
        ));
    }
}
