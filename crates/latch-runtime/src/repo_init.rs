use std::sync::Arc;

use async_trait::async_trait;

use latch_core::coordination::RepoInitProvider;
use latch_core::error::{LatchError, Result};
use latch_core::store::CoordinationStore;

pub const REPO_INIT_KEY: &str = "repoInit.json";

/// [`RepoInitProvider`] reading a JSON document from the coordination store.
pub struct StoreRepoInitProvider {
    store: Arc<dyn CoordinationStore>,
    key: String,
}

impl StoreRepoInitProvider {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self::with_key(store, REPO_INIT_KEY)
    }

    pub fn with_key(store: Arc<dyn CoordinationStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }
}

#[async_trait]
impl RepoInitProvider for StoreRepoInitProvider {
    async fn get_repo_init(&self) -> Result<Option<serde_json::Value>> {
        match self.store.get(&self.key).await? {
            Some(record) => Ok(Some(serde_json::from_slice(&record.value)?)),
            None => Ok(None),
        }
    }

    async fn cleanup(&self) -> Result<()> {
        match self.store.delete(&self.key, None).await {
            Ok(()) | Err(LatchError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
