use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;

use latch_core::error::{LatchError, Result};
use latch_core::store::{key_parent, ConnectionState, CoordinationStore, VersionedValue};

#[derive(Debug, Clone)]
struct Record {
    value: Vec<u8>,
    version: u64,
    /// Owning session for ephemeral records.
    owner: Option<String>,
}

#[derive(Default)]
struct ClusterData {
    records: BTreeMap<String, Record>,
    key_watchers: HashMap<String, watch::Sender<Option<u64>>>,
    child_watchers: HashMap<String, watch::Sender<u64>>,
    next_session: u64,
}

impl ClusterData {
    fn notify_key(&mut self, key: &str, version: Option<u64>) {
        if let Some(tx) = self.key_watchers.get(key) {
            if tx.receiver_count() == 0 {
                self.key_watchers.remove(key);
            } else {
                tx.send_replace(version);
            }
        }
    }

    fn notify_children(&mut self, key: &str) {
        let parent = key_parent(key);
        if let Some(tx) = self.child_watchers.get(parent) {
            if tx.receiver_count() == 0 {
                self.child_watchers.remove(parent);
            } else {
                tx.send_modify(|count| *count += 1);
            }
        }
    }

    fn insert(&mut self, key: &str, record: Record) -> u64 {
        let version = record.version;
        let created = self.records.insert(key.to_string(), record).is_none();
        self.notify_key(key, Some(version));
        if created {
            self.notify_children(key);
        }
        version
    }

    fn remove(&mut self, key: &str) -> Option<Record> {
        let removed = self.records.remove(key);
        if removed.is_some() {
            self.notify_key(key, None);
            self.notify_children(key);
        }
        removed
    }

    fn drop_session(&mut self, session: &str) -> usize {
        let owned: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| r.owner.as_deref() == Some(session))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &owned {
            self.remove(key);
        }
        owned.len()
    }
}

/// Shared state of an in-process cluster. Each [`MemoryCluster::connect`]
/// opens an independent session, standing in for one node.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    data: Arc<Mutex<ClusterData>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session against this cluster.
    pub fn connect(&self) -> MemoryCoordinationStore {
        let session_id = {
            let mut data = lock(&self.data);
            data.next_session += 1;
            format!("memory-session-{}", data.next_session)
        };
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        MemoryCoordinationStore {
            data: self.data.clone(),
            session_id,
            state_tx,
        }
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        lock(&self.data).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock(data: &Mutex<ClusterData>) -> MutexGuard<'_, ClusterData> {
    // The data is plain maps; a panic elsewhere leaves it consistent.
    data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One session against a [`MemoryCluster`].
pub struct MemoryCoordinationStore {
    data: Arc<Mutex<ClusterData>>,
    session_id: String,
    state_tx: watch::Sender<ConnectionState>,
}

impl MemoryCoordinationStore {
    /// Simulate losing contact: operations fail until [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.state_tx.send_replace(ConnectionState::Suspended);
    }

    /// Simulate session expiry: ephemeral records vanish and operations
    /// fail until [`resume`](Self::resume).
    pub fn expire(&self) {
        let dropped = lock(&self.data).drop_session(&self.session_id);
        tracing::debug!(session = %self.session_id, dropped, "Memory session expired");
        self.state_tx.send_replace(ConnectionState::Lost);
    }

    /// Restore contact after [`suspend`](Self::suspend) or [`expire`](Self::expire).
    pub fn resume(&self) {
        self.state_tx.send_replace(ConnectionState::Reconnected);
    }

    fn check_connected(&self) -> Result<()> {
        let state = *self.state_tx.borrow();
        if state.is_error() {
            return Err(LatchError::Connectivity(format!(
                "session {} is {}",
                self.session_id, state
            )));
        }
        Ok(())
    }

    fn create_with_owner(&self, key: &str, value: &[u8], owner: Option<String>) -> Result<u64> {
        self.check_connected()?;
        let mut data = lock(&self.data);
        if data.records.contains_key(key) {
            return Err(LatchError::AlreadyExists(key.to_string()));
        }
        Ok(data.insert(
            key,
            Record {
                value: value.to_vec(),
                version: 0,
                owner,
            },
        ))
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        self.check_connected()?;
        let data = lock(&self.data);
        Ok(data.records.get(key).map(|r| VersionedValue {
            value: r.value.clone(),
            version: r.version,
        }))
    }

    async fn create(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.create_with_owner(key, value, None)
    }

    async fn create_ephemeral(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.create_with_owner(key, value, Some(self.session_id.clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.check_connected()?;
        let mut data = lock(&self.data);
        let record = match data.records.get(key) {
            Some(existing) => Record {
                value: value.to_vec(),
                version: existing.version + 1,
                owner: existing.owner.clone(),
            },
            None => Record {
                value: value.to_vec(),
                version: 0,
                owner: None,
            },
        };
        Ok(data.insert(key, record))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &[u8],
    ) -> Result<Option<u64>> {
        self.check_connected()?;
        let mut data = lock(&self.data);
        let current = data.records.get(key).cloned();
        let record = match (current, expected) {
            (None, None) => Record {
                value: value.to_vec(),
                version: 0,
                owner: None,
            },
            (Some(existing), Some(version)) if existing.version == version => Record {
                value: value.to_vec(),
                version: version + 1,
                owner: existing.owner,
            },
            _ => return Ok(None),
        };
        Ok(Some(data.insert(key, record)))
    }

    async fn delete(&self, key: &str, expected: Option<u64>) -> Result<()> {
        self.check_connected()?;
        let mut data = lock(&self.data);
        match (data.records.get(key), expected) {
            (None, _) => Err(LatchError::NotFound(key.to_string())),
            (Some(existing), Some(version)) if existing.version != version => {
                Err(LatchError::VersionMismatch(format!(
                    "{} is at version {}, expected {}",
                    key, existing.version, version
                )))
            }
            _ => {
                data.remove(key);
                Ok(())
            }
        }
    }

    async fn children(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_connected()?;
        let data = lock(&self.data);
        let start = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix)
        };
        let names: BTreeSet<String> = data
            .records
            .range(start.clone()..)
            .take_while(|(k, _)| k.starts_with(&start))
            .filter_map(|(k, _)| k[start.len()..].split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn sync(&self, _prefix: &str) -> Result<()> {
        self.check_connected()
    }

    async fn watch(&self, key: &str) -> Result<watch::Receiver<Option<u64>>> {
        let mut data = lock(&self.data);
        let current = data.records.get(key).map(|r| r.version);
        let tx = data
            .key_watchers
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(current).0);
        tx.send_replace(current);
        Ok(tx.subscribe())
    }

    async fn watch_children(&self, prefix: &str) -> Result<watch::Receiver<u64>> {
        let mut data = lock(&self.data);
        let tx = data
            .child_watchers
            .entry(prefix.to_string())
            .or_insert_with(|| watch::channel(0).0);
        Ok(tx.subscribe())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        lock(&self.data).drop_session(&self.session_id);
        self.state_tx.send_replace(ConnectionState::Lost);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_versioned_set() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect();

        assert_eq!(store.create("a", b"1").await.unwrap(), 0);
        assert!(matches!(
            store.create("a", b"2").await,
            Err(LatchError::AlreadyExists(_))
        ));
        assert_eq!(store.set("a", b"3").await.unwrap(), 1);

        let value = store.get("a").await.unwrap().unwrap();
        assert_eq!(value.value, b"3");
        assert_eq!(value.version, 1);
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect();

        assert_eq!(store.compare_and_set("c", None, b"0").await.unwrap(), Some(0));
        assert_eq!(store.compare_and_set("c", None, b"0").await.unwrap(), None);
        assert_eq!(store.compare_and_set("c", Some(5), b"1").await.unwrap(), None);
        assert_eq!(store.compare_and_set("c", Some(0), b"1").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_delete_checks_version() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect();
        store.create("d", b"x").await.unwrap();

        assert!(matches!(
            store.delete("d", Some(3)).await,
            Err(LatchError::VersionMismatch(_))
        ));
        store.delete("d", Some(0)).await.unwrap();
        assert!(matches!(
            store.delete("d", None).await,
            Err(LatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_children_are_immediate_segments() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect();
        store.create("txns/open/7/1", b"").await.unwrap();
        store.create("txns/open/7/2", b"").await.unwrap();
        store.create("txns/open/9/3", b"").await.unwrap();
        store.create("txns/openish", b"").await.unwrap();

        assert_eq!(store.children("txns/open").await.unwrap(), vec!["7", "9"]);
        assert_eq!(store.children("txns/open/7").await.unwrap(), vec!["1", "2"]);
        assert!(store.children("txns/open/8").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ephemeral_records_die_with_session() {
        let cluster = MemoryCluster::new();
        let a = cluster.connect();
        let b = cluster.connect();

        a.create_ephemeral("group/members/1", b"a").await.unwrap();
        b.create("persistent", b"b").await.unwrap();

        a.expire();
        assert!(b.get("group/members/1").await.unwrap().is_none());
        assert!(b.get("persistent").await.unwrap().is_some());
        assert!(matches!(a.get("persistent").await, Err(LatchError::Connectivity(_))));

        a.resume();
        assert!(a.get("persistent").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_watch_follows_versions() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect();

        let mut rx = store.watch("w").await.unwrap();
        assert_eq!(*rx.borrow(), None);

        store.create("w", b"").await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Some(0));

        store.delete("w", None).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), None);
    }

    #[tokio::test]
    async fn test_watch_children_counts_membership_changes() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect();

        let mut rx = store.watch_children("group/members").await.unwrap();
        store.create("group/members/1", b"").await.unwrap();
        store.set("group/members/1", b"again").await.unwrap();
        store.delete("group/members/1", None).await.unwrap();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 2);
    }

    #[tokio::test]
    async fn test_suspend_reports_state() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect();
        let mut state = store.connection_state();

        store.suspend();
        state.changed().await.unwrap();
        assert_eq!(*state.borrow_and_update(), ConnectionState::Suspended);

        store.resume();
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Reconnected);
    }
}
