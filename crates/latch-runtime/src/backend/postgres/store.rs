use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use latch_core::config::ClusterConfig;
use latch_core::error::{LatchError, Result};
use latch_core::store::{key_parent, ConnectionState, CoordinationStore, VersionedValue};

use super::pool::db_err;

/// Channel the record trigger notifies on.
pub const RECORDS_CHANNEL: &str = "latch_records";

const LISTEN_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordChange {
    namespace: String,
    op: ChangeOp,
    version: u64,
    key: String,
}

/// Parse a trigger payload of the form `namespace:OP:version:key`.
fn parse_notification(payload: &str) -> Option<RecordChange> {
    let mut parts = payload.splitn(4, ':');
    let namespace = parts.next()?;
    let op = match parts.next()? {
        "INSERT" => ChangeOp::Insert,
        "UPDATE" => ChangeOp::Update,
        "DELETE" => ChangeOp::Delete,
        _ => return None,
    };
    let version = parts.next()?.parse().ok()?;
    let key = parts.next()?;
    Some(RecordChange {
        namespace: namespace.to_string(),
        op,
        version,
        key: key.to_string(),
    })
}

#[derive(Default)]
struct Watchers {
    keys: HashMap<String, watch::Sender<Option<u64>>>,
    children: HashMap<String, watch::Sender<u64>>,
}

impl Watchers {
    fn apply(&mut self, change: &RecordChange) {
        let version = match change.op {
            ChangeOp::Delete => None,
            _ => Some(change.version),
        };
        if let Some(tx) = self.keys.get(&change.key) {
            if tx.receiver_count() == 0 {
                self.keys.remove(&change.key);
            } else {
                tx.send_replace(version);
            }
        }
        if change.op != ChangeOp::Update {
            let parent = key_parent(&change.key);
            if let Some(tx) = self.children.get(parent) {
                if tx.receiver_count() == 0 {
                    self.children.remove(parent);
                } else {
                    tx.send_modify(|count| *count += 1);
                }
            }
        }
    }
}

struct Session {
    pool: PgPool,
    namespace: String,
    id: String,
    hostname: String,
    heartbeat_interval: Duration,
    session_timeout: Duration,
    watchers: StdMutex<Watchers>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Session {
    fn watchers(&self) -> MutexGuard<'_, Watchers> {
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state() != state {
            tracing::info!(session = %self.id, state = %state, "Connection state changed");
            self.state_tx.send_replace(state);
        }
    }

    async fn register(&self) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO latch_sessions (id, namespace, hostname)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET last_heartbeat = NOW()
            "#,
        )
        .bind(&self.id)
        .bind(&self.namespace)
        .bind(&self.hostname)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Refresh our heartbeat. `false` when a peer already reaped the session.
    async fn beat(&self) -> Result<bool> {
        let result = sqlx::query("UPDATE latch_sessions SET last_heartbeat = NOW() WHERE id = $1")
            .bind(&self.id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    /// Expire silent sessions; their ephemeral records go with them.
    async fn reap(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM latch_sessions
            WHERE last_heartbeat < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(self.session_timeout.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        let count = result.rows_affected();
        if count > 0 {
            tracing::info!(count, "Reaped expired sessions");
        }
        Ok(count)
    }

    async fn current_version(&self, key: &str) -> Result<Option<u64>> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM latch_records WHERE namespace = $1 AND key = $2",
        )
        .bind(&self.namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(version.map(|v| v as u64))
    }

    /// Re-read every watched key after notifications may have been missed.
    async fn resync(&self) {
        let keys: Vec<String> = self.watchers().keys.keys().cloned().collect();
        for key in keys {
            match self.current_version(&key).await {
                Ok(version) => {
                    if let Some(tx) = self.watchers().keys.get(&key) {
                        tx.send_replace(version);
                    }
                }
                Err(e) => tracing::debug!(key = %key, error = %e, "Resync read failed"),
            }
        }
        for tx in self.watchers().children.values() {
            tx.send_modify(|count| *count += 1);
        }
    }
}

async fn heartbeat_loop(session: Arc<Session>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut failing_since: Option<Instant> = None;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(session.heartbeat_interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        }

        match session.beat().await {
            Ok(true) => {
                if failing_since.take().is_some() || session.state().is_error() {
                    session.set_state(ConnectionState::Reconnected);
                }
            }
            Ok(false) => {
                tracing::warn!(session = %session.id, "Session was expired by a peer");
                session.set_state(ConnectionState::Lost);
                match session.register().await {
                    Ok(()) => {
                        failing_since = None;
                        session.set_state(ConnectionState::Reconnected);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to re-register session");
                        failing_since.get_or_insert_with(Instant::now);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(session = %session.id, error = %e, "Failed to send heartbeat");
                let since = *failing_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= session.session_timeout {
                    session.set_state(ConnectionState::Lost);
                } else if !session.state().is_error() {
                    session.set_state(ConnectionState::Suspended);
                }
            }
        }

        if let Err(e) = session.reap().await {
            tracing::debug!(error = %e, "Failed to reap expired sessions");
        }
    }
}

async fn listen_loop(session: Arc<Session>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        let listener = async {
            let mut listener = PgListener::connect_with(&session.pool).await?;
            listener.listen(RECORDS_CHANNEL).await?;
            Ok::<_, sqlx::Error>(listener)
        };
        let mut listener = match listener.await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for record changes");
                tokio::select! {
                    _ = tokio::time::sleep(LISTEN_RETRY) => continue,
                    _ = shutdown_rx.changed() => return,
                }
            }
        };
        tracing::debug!(channel = RECORDS_CHANNEL, "Listening for record changes");
        session.resync().await;

        loop {
            tokio::select! {
                notification = listener.recv() => match notification {
                    Ok(notification) => match parse_notification(notification.payload()) {
                        Some(change) if change.namespace == session.namespace => {
                            session.watchers().apply(&change);
                        }
                        Some(_) => {}
                        None => tracing::warn!(
                            payload = notification.payload(),
                            "Invalid record change notification"
                        ),
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "Error receiving record change");
                        break;
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// [`CoordinationStore`] session on PostgreSQL. Ephemeral records are
/// owned by a heartbeated session row and cascade away when it is reaped.
pub struct PgCoordinationStore {
    session: Arc<Session>,
    shutdown_tx: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PgCoordinationStore {
    /// Open a session and start its heartbeat and change listener.
    pub async fn connect(pool: PgPool, config: &ClusterConfig, hostname: &str) -> Result<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        let session = Arc::new(Session {
            pool,
            namespace: config.namespace.clone(),
            id: uuid::Uuid::new_v4().simple().to_string(),
            hostname: hostname.to_string(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            session_timeout: Duration::from_secs(config.session_timeout_secs),
            watchers: StdMutex::new(Watchers::default()),
            state_tx,
        });
        session.register().await?;
        tracing::info!(
            session = %session.id,
            namespace = %session.namespace,
            "Coordination session opened"
        );

        let (shutdown_tx, _) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(heartbeat_loop(session.clone(), shutdown_tx.subscribe())),
            tokio::spawn(listen_loop(session.clone(), shutdown_tx.subscribe())),
        ];
        Ok(Self {
            session,
            shutdown_tx,
            tasks: StdMutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    fn ns(&self) -> &str {
        &self.session.namespace
    }

    async fn insert(&self, key: &str, value: &[u8], owner: Option<&str>) -> Result<Option<u64>> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO latch_records (namespace, key, value, version, owner_session)
            VALUES ($1, $2, $3, 0, $4)
            ON CONFLICT (namespace, key) DO NOTHING
            RETURNING version
            "#,
        )
        .bind(self.ns())
        .bind(key)
        .bind(value)
        .bind(owner)
        .fetch_optional(&self.session.pool)
        .await
        .map_err(db_err)?;
        Ok(version.map(|v| v as u64))
    }
}

#[async_trait]
impl CoordinationStore for PgCoordinationStore {
    fn session_id(&self) -> &str {
        &self.session.id
    }

    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        let row: Option<(Vec<u8>, i64)> = sqlx::query_as(
            "SELECT value, version FROM latch_records WHERE namespace = $1 AND key = $2",
        )
        .bind(self.ns())
        .bind(key)
        .fetch_optional(&self.session.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|(value, version)| VersionedValue {
            value,
            version: version as u64,
        }))
    }

    async fn create(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.insert(key, value, None)
            .await?
            .ok_or_else(|| LatchError::AlreadyExists(key.to_string()))
    }

    async fn create_ephemeral(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.insert(key, value, Some(self.session.id.as_str()))
            .await?
            .ok_or_else(|| LatchError::AlreadyExists(key.to_string()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<u64> {
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO latch_records (namespace, key, value, version)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (namespace, key) DO UPDATE
            SET value = EXCLUDED.value,
                version = latch_records.version + 1,
                updated_at = NOW()
            RETURNING version
            "#,
        )
        .bind(self.ns())
        .bind(key)
        .bind(value)
        .fetch_one(&self.session.pool)
        .await
        .map_err(db_err)?;
        Ok(version as u64)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &[u8],
    ) -> Result<Option<u64>> {
        let Some(expected) = expected else {
            return self.insert(key, value, None).await;
        };
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE latch_records
            SET value = $3, version = version + 1, updated_at = NOW()
            WHERE namespace = $1 AND key = $2 AND version = $4
            RETURNING version
            "#,
        )
        .bind(self.ns())
        .bind(key)
        .bind(value)
        .bind(expected as i64)
        .fetch_optional(&self.session.pool)
        .await
        .map_err(db_err)?;
        Ok(version.map(|v| v as u64))
    }

    async fn delete(&self, key: &str, expected: Option<u64>) -> Result<()> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM latch_records
            WHERE namespace = $1 AND key = $2 AND ($3::BIGINT IS NULL OR version = $3)
            "#,
        )
        .bind(self.ns())
        .bind(key)
        .bind(expected.map(|v| v as i64))
        .execute(&self.session.pool)
        .await
        .map_err(db_err)?
        .rows_affected();
        if deleted > 0 {
            return Ok(());
        }
        match self.session.current_version(key).await? {
            None => Err(LatchError::NotFound(key.to_string())),
            Some(current) => Err(LatchError::VersionMismatch(format!(
                "{} is at version {}, expected {:?}",
                key, current, expected
            ))),
        }
    }

    async fn children(&self, prefix: &str) -> Result<Vec<String>> {
        let start = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix)
        };
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT split_part(substr(key, $3), '/', 1) AS name
            FROM latch_records
            WHERE namespace = $1 AND starts_with(key, $2)
            ORDER BY name
            "#,
        )
        .bind(self.ns())
        .bind(&start)
        .bind(start.chars().count() as i32 + 1)
        .fetch_all(&self.session.pool)
        .await
        .map_err(db_err)?;
        Ok(names.into_iter().filter(|n| !n.is_empty()).collect())
    }

    async fn sync(&self, _prefix: &str) -> Result<()> {
        // Reads go to the primary, so a round trip is enough.
        sqlx::query("SELECT 1")
            .execute(&self.session.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn watch(&self, key: &str) -> Result<watch::Receiver<Option<u64>>> {
        let rx = self
            .session
            .watchers()
            .keys
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();
        let current = self.session.current_version(key).await?;
        if let Some(tx) = self.session.watchers().keys.get(key) {
            tx.send_replace(current);
        }
        Ok(rx)
    }

    async fn watch_children(&self, prefix: &str) -> Result<watch::Receiver<u64>> {
        Ok(self
            .session
            .watchers()
            .children
            .entry(prefix.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.session.state_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Session task ended abnormally");
            }
        }
        let result = sqlx::query("DELETE FROM latch_sessions WHERE id = $1")
            .bind(&self.session.id)
            .execute(&self.session.pool)
            .await
            .map_err(db_err);
        self.session.set_state(ConnectionState::Lost);
        tracing::info!(session = %self.session.id, "Coordination session closed");
        result.map(|_| ())
    }
}
