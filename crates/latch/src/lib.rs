//! latch: distributed coordination for a cluster of storage nodes.
//!
//! A [`SyncContext`] bundles the object locker, named lockers, leadership,
//! transaction bookkeeping, signal broadcast, the reprocessing queue and the
//! single-flight progress tracker for one node.

mod context;

pub use context::{
    local_hostname, Backends, SyncCallbacks, SyncContext, SyncContextBuilder,
    DESIGN_LOCK_PATH, OBJECT_LOCKS_PATH, SCHEMA_NAME_LOCK_PATH, STARTUP_LOCK_PATH,
    USERNAME_LOCK_PATH,
};

pub use latch_core;
pub use latch_runtime;

pub mod prelude {
    pub use crate::{SyncCallbacks, SyncContext, SyncContextBuilder};
    pub use latch_core::cluster::{ClusterInfo, NodeId};
    pub use latch_core::config::LatchConfig;
    pub use latch_core::coordination::{
        AllHandlesUpdaterSync, CheckableLocker, LeadershipManager, NameLocker, ReadWriteLocker,
        RepoInitProvider, SignalWatcher, TransactionManager, TransactionReprocessingQueue,
    };
    pub use latch_core::error::{LatchError, Result};
    pub use latch_core::signal::Signal;
    pub use latch_core::transaction::{Transaction, TxnId, TxnOp};
}
