use async_trait::async_trait;

use crate::error::Result;

/// One-shot repository bootstrap document left in the store by an operator.
#[async_trait]
pub trait RepoInitProvider: Send + Sync {
    async fn get_repo_init(&self) -> Result<Option<serde_json::Value>>;

    async fn cleanup(&self) -> Result<()>;
}
