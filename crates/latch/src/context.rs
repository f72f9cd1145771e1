//! The sync context: every coordination component of one node, built from
//! configuration and started and stopped as a unit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use latch_core::alert::{Alerter, LogAlerter};
use latch_core::clock::{Clock, SystemClock};
use latch_core::cluster::{ClusterInfo, LeadershipState, NodeId};
use latch_core::config::{LatchConfig, SignalTransport, StoreBackend};
use latch_core::coordination::{
    AllHandlesUpdaterSync, CheckableLocker, LeadershipManager, MembershipListener, NameLocker,
    ReadWriteLocker, RepoInitProvider, ReplayHandler, SignalListener, SignalWatcher,
    TransactionManager, TransactionReprocessingQueue,
};
use latch_core::error::{LatchError, Result};
use latch_core::signal::Signal;
use latch_core::store::{CoordinationStore, DurableLog};

use latch_runtime::backend::memory::{MemoryCluster, MemoryLog};
use latch_runtime::backend::postgres::{
    Database, MigrationRunner, PgCoordinationStore, PgDurableLog,
};
use latch_runtime::cluster::{
    current_leader, SingleInstanceLeadershipManager, StoreLeadershipManager,
};
use latch_runtime::instrumented::{InstrumentedNameLocker, InstrumentedTransactionManager};
use latch_runtime::lock::{StoreCheckableLocker, StoreReadWriteLocker, StripedNameLocker};
use latch_runtime::progress::StoreAllHandlesUpdaterSync;
use latch_runtime::repo_init::StoreRepoInitProvider;
use latch_runtime::reprocessing::{ErrorCatchingReprocessingQueue, LogReprocessingQueue};
use latch_runtime::signals::{LogSignalWatcher, StoreSignalWatcher};
use latch_runtime::transactions::StoreTransactionManager;

pub const OBJECT_LOCKS_PATH: &str = "locks/objects";
pub const STARTUP_LOCK_PATH: &str = "locks/startup";
pub const SCHEMA_NAME_LOCK_PATH: &str = "locks/schemaName";
pub const USERNAME_LOCK_PATH: &str = "locks/username";
pub const DESIGN_LOCK_PATH: &str = "locks/design";

/// Hostname of this machine, or `unknown`.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Raw backend handles for one configuration.
pub struct Backends {
    pub store: Arc<dyn CoordinationStore>,
    pub log: Option<Arc<dyn DurableLog>>,
    pub database: Option<Database>,
}

impl Backends {
    /// Open the configured store, and the durable log when `with_log`. The
    /// postgres backend installs its schema first.
    pub async fn connect(
        config: &LatchConfig,
        clock: Arc<dyn Clock>,
        hostname: &str,
        with_log: bool,
    ) -> Result<Self> {
        match config.cluster.backend {
            StoreBackend::Memory => Ok(Self {
                store: Arc::new(MemoryCluster::new().connect()),
                log: with_log.then(|| Arc::new(MemoryLog::new(clock)) as Arc<dyn DurableLog>),
                database: None,
            }),
            StoreBackend::Postgres => {
                let database = Database::from_config(&config.cluster).await?;
                let applied = MigrationRunner::new(database.pool().clone()).run().await?;
                if !applied.is_empty() {
                    tracing::info!(?applied, "Installed coordination schema");
                }
                let store =
                    PgCoordinationStore::connect(database.pool().clone(), &config.cluster, hostname)
                        .await?;
                let log = with_log.then(|| {
                    Arc::new(PgDurableLog::new(
                        database.pool().clone(),
                        config.cluster.namespace.clone(),
                        clock,
                    )) as Arc<dyn DurableLog>
                });
                Ok(Self {
                    store: Arc::new(store),
                    log,
                    database: Some(database),
                })
            }
        }
    }

    /// Close the store, then the log, then the pool.
    pub async fn close(&self) {
        if let Err(e) = self.store.close().await {
            tracing::warn!(error = %e, "Failed to close coordination store");
        }
        if let Some(log) = &self.log {
            if let Err(e) = log.close().await {
                tracing::warn!(error = %e, "Failed to close durable log");
            }
        }
        if let Some(database) = &self.database {
            database.close().await;
        }
    }
}

/// Callbacks a node supplies when starting its context.
#[derive(Clone)]
pub struct SyncCallbacks {
    pub membership: Option<Arc<dyn MembershipListener>>,
    pub signals: Arc<dyn SignalListener>,
    pub replay: Option<Arc<dyn ReplayHandler>>,
}

impl SyncCallbacks {
    pub fn new() -> Self {
        Self {
            membership: None,
            signals: Arc::new(|signal: Signal| {
                tracing::debug!(signal = %signal, "Ignoring signal");
            }),
            replay: None,
        }
    }

    pub fn with_membership(mut self, listener: Arc<dyn MembershipListener>) -> Self {
        self.membership = Some(listener);
        self
    }

    pub fn with_signals(mut self, listener: Arc<dyn SignalListener>) -> Self {
        self.signals = listener;
        self
    }

    pub fn with_replay(mut self, handler: Arc<dyn ReplayHandler>) -> Self {
        self.replay = Some(handler);
        self
    }
}

impl Default for SyncCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`SyncContext`].
pub struct SyncContextBuilder {
    config: LatchConfig,
    store: Option<Arc<dyn CoordinationStore>>,
    log: Option<Arc<dyn DurableLog>>,
    clock: Option<Arc<dyn Clock>>,
    alerter: Option<Arc<dyn Alerter>>,
    hostname: Option<String>,
}

impl SyncContextBuilder {
    pub fn new(config: LatchConfig) -> Self {
        Self {
            config,
            store: None,
            log: None,
            clock: None,
            alerter: None,
            hostname: None,
        }
    }

    /// Use this store instead of connecting one. The node then always runs
    /// the distributed leadership protocol.
    pub fn store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn log(mut self, log: Arc<dyn DurableLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = Some(alerter);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Connect backends and assemble every component. The node id is
    /// resolved here; nothing runs until [`SyncContext::start`].
    pub async fn build(self) -> Result<SyncContext> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let alerter = self.alerter.unwrap_or_else(|| Arc::new(LogAlerter));
        let hostname = self.hostname.unwrap_or_else(local_hostname);
        let transport = config.signal_transport();
        let needs_log = config.reprocessing_enabled() || transport == SignalTransport::Log;
        let shared_store = self.store.is_some();

        let backends = match self.store {
            Some(store) => {
                let log = match self.log {
                    Some(log) => Some(log),
                    None if needs_log => {
                        Some(Arc::new(MemoryLog::new(clock.clone())) as Arc<dyn DurableLog>)
                    }
                    None => None,
                };
                Backends {
                    store,
                    log,
                    database: None,
                }
            }
            None => {
                let mut backends =
                    Backends::connect(&config, clock.clone(), &hostname, needs_log && self.log.is_none())
                        .await?;
                if let Some(log) = self.log {
                    backends.log = Some(log);
                }
                backends
            }
        };
        let store = backends.store.clone();

        let configured_id = config.node.id.map(NodeId::new).transpose()?;
        let leadership: Arc<dyn LeadershipManager> =
            if config.cluster.backend == StoreBackend::Memory && !shared_store {
                Arc::new(SingleInstanceLeadershipManager::new(
                    configured_id.unwrap_or(NodeId::new(0)?),
                ))
            } else {
                Arc::new(
                    StoreLeadershipManager::new(
                        store.clone(),
                        config.leadership.clone(),
                        configured_id,
                        hostname.clone(),
                    )
                    .await?,
                )
            };

        let cancel = CancellationToken::new();
        let striped = Arc::new(StripedNameLocker::new(
            store.clone(),
            OBJECT_LOCKS_PATH,
            alerter.clone(),
            cancel.child_token(),
        ));
        let checkable = |path: &str| -> Arc<dyn CheckableLocker> {
            Arc::new(StoreCheckableLocker::new(
                store.clone(),
                path,
                alerter.clone(),
                cancel.child_token(),
            ))
        };
        let startup_locker = checkable(STARTUP_LOCK_PATH);
        let schema_name_locker = checkable(SCHEMA_NAME_LOCK_PATH);
        let username_locker = checkable(USERNAME_LOCK_PATH);
        let design_locker: Arc<dyn ReadWriteLocker> = Arc::new(StoreReadWriteLocker::new(
            store.clone(),
            DESIGN_LOCK_PATH,
            alerter.clone(),
            cancel.child_token(),
        ));

        let mut object_locker: Arc<dyn NameLocker> = striped.clone();
        let mut transactions: Arc<dyn TransactionManager> =
            Arc::new(StoreTransactionManager::new(store.clone(), clock.clone()));
        if config.observability.instrument {
            object_locker = Arc::new(InstrumentedNameLocker::new(object_locker));
            transactions = Arc::new(InstrumentedTransactionManager::new(transactions));
        }

        let require_log = || {
            backends.log.clone().ok_or_else(|| {
                LatchError::Config("a durable log is required but none is configured".to_string())
            })
        };
        let signals: Arc<dyn SignalWatcher> = match transport {
            SignalTransport::Store => Arc::new(StoreSignalWatcher::new(
                store.clone(),
                alerter.clone(),
                config.signals.retry_delay(),
            )),
            SignalTransport::Log => {
                Arc::new(LogSignalWatcher::new(require_log()?, config.signals.topic.clone()))
            }
        };

        let reprocessing: Option<Arc<dyn TransactionReprocessingQueue>> =
            match config.reprocessing.as_ref().filter(|r| r.enabled) {
                Some(settings) => {
                    let queue = LogReprocessingQueue::new(
                        require_log()?,
                        clock.clone(),
                        alerter.clone(),
                        settings.clone(),
                    );
                    Some(Arc::new(ErrorCatchingReprocessingQueue::new(
                        Arc::new(queue),
                        alerter.clone(),
                        settings.fallback_retry_interval(),
                    )))
                }
                None => None,
            };

        tracing::info!(
            node_id = %leadership.node_id(),
            backend = ?config.cluster.backend,
            signals = ?transport,
            reprocessing = reprocessing.is_some(),
            "Sync context built"
        );

        Ok(SyncContext {
            progress: Arc::new(StoreAllHandlesUpdaterSync::new(store.clone(), clock.clone())),
            repo_init: Arc::new(StoreRepoInitProvider::new(store.clone())),
            config,
            backends,
            clock,
            alerter,
            striped,
            object_locker,
            startup_locker,
            schema_name_locker,
            username_locker,
            design_locker,
            leadership,
            transactions,
            signals,
            reprocessing,
            cancel,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

/// Every coordination component of one node.
pub struct SyncContext {
    config: LatchConfig,
    backends: Backends,
    clock: Arc<dyn Clock>,
    alerter: Arc<dyn Alerter>,
    striped: Arc<StripedNameLocker>,
    object_locker: Arc<dyn NameLocker>,
    startup_locker: Arc<dyn CheckableLocker>,
    schema_name_locker: Arc<dyn CheckableLocker>,
    username_locker: Arc<dyn CheckableLocker>,
    design_locker: Arc<dyn ReadWriteLocker>,
    leadership: Arc<dyn LeadershipManager>,
    transactions: Arc<dyn TransactionManager>,
    signals: Arc<dyn SignalWatcher>,
    reprocessing: Option<Arc<dyn TransactionReprocessingQueue>>,
    progress: Arc<dyn AllHandlesUpdaterSync>,
    repo_init: Arc<dyn RepoInitProvider>,
    cancel: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
}

impl SyncContext {
    pub fn builder(config: LatchConfig) -> SyncContextBuilder {
        SyncContextBuilder::new(config)
    }

    /// Join the group, then start transactions, signals and reprocessing.
    pub async fn start(&self, callbacks: SyncCallbacks) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return Err(LatchError::InvalidState(
                "sync context already started".to_string(),
            ));
        }
        if self.reprocessing.is_some() && callbacks.replay.is_none() {
            return Err(LatchError::Config(
                "reprocessing is enabled but no replay handler was supplied".to_string(),
            ));
        }

        if let Some(listener) = callbacks.membership {
            self.leadership.on_group_membership_change(listener);
        }
        self.leadership.start(self.config.node.can_be_leader).await?;
        let node_id = self.leadership.node_id();

        self.transactions.start(node_id).await?;
        self.signals.start(node_id, callbacks.signals).await?;
        if let (Some(queue), Some(handler)) = (&self.reprocessing, callbacks.replay) {
            queue.start(handler, self.transactions.clone()).await?;
        }

        tracing::info!(
            node_id = %node_id,
            state = %self.leadership_state(),
            "Sync context started"
        );
        Ok(())
    }

    /// Stop signals, leadership, transactions and reprocessing in that
    /// order, then close the backends. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(node_id = %self.node_id(), "Sync context shutting down");

        self.signals.shutdown().await;
        self.leadership.shutdown().await;
        self.transactions.shutdown().await;
        if let Some(queue) = &self.reprocessing {
            queue.shutdown().await;
        }
        self.striped.shutdown();
        self.cancel.cancel();
        self.backends.close().await;

        tracing::info!("Sync context stopped");
    }

    pub fn node_id(&self) -> NodeId {
        self.leadership.node_id()
    }

    pub fn config(&self) -> &LatchConfig {
        &self.config
    }

    /// Read-only nodes take part in locking and signals but never open
    /// transactions.
    pub fn is_read_only(&self) -> bool {
        self.config.node.read_only
    }

    pub fn store(&self) -> Arc<dyn CoordinationStore> {
        self.backends.store.clone()
    }

    pub fn log(&self) -> Option<Arc<dyn DurableLog>> {
        self.backends.log.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn alerter(&self) -> Arc<dyn Alerter> {
        self.alerter.clone()
    }

    /// Per-object locks, striped over `locks/objects`.
    pub fn object_locker(&self) -> Arc<dyn NameLocker> {
        self.object_locker.clone()
    }

    pub fn startup_locker(&self) -> Arc<dyn CheckableLocker> {
        self.startup_locker.clone()
    }

    pub fn schema_name_locker(&self) -> Arc<dyn CheckableLocker> {
        self.schema_name_locker.clone()
    }

    pub fn username_locker(&self) -> Arc<dyn CheckableLocker> {
        self.username_locker.clone()
    }

    pub fn design_locker(&self) -> Arc<dyn ReadWriteLocker> {
        self.design_locker.clone()
    }

    pub fn leadership(&self) -> Arc<dyn LeadershipManager> {
        self.leadership.clone()
    }

    pub fn leadership_state(&self) -> LeadershipState {
        LeadershipState::from_is_leader(self.leadership.is_this_instance_leader())
    }

    pub fn transactions(&self) -> Arc<dyn TransactionManager> {
        self.transactions.clone()
    }

    pub fn signals(&self) -> Arc<dyn SignalWatcher> {
        self.signals.clone()
    }

    pub fn reprocessing(&self) -> Option<Arc<dyn TransactionReprocessingQueue>> {
        self.reprocessing.clone()
    }

    pub fn all_handles_updater(&self) -> Arc<dyn AllHandlesUpdaterSync> {
        self.progress.clone()
    }

    pub fn repo_init_provider(&self) -> Arc<dyn RepoInitProvider> {
        self.repo_init.clone()
    }

    /// Members and leader as currently recorded.
    pub async fn cluster_info(&self) -> Result<ClusterInfo> {
        let node_id = self.node_id();
        let members = self.leadership.get_group_members().await?;
        let leader = if self.leadership.is_this_instance_leader() {
            Some(node_id)
        } else {
            current_leader(self.backends.store.as_ref()).await?
        };
        Ok(ClusterInfo {
            namespace: self.config.cluster.namespace.clone(),
            node_id,
            members,
            leader,
        })
    }
}
