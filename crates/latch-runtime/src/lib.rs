//! Coordination algorithms over the `latch-core` backend traits, plus the
//! in-memory and PostgreSQL backends.

pub mod backend;
pub mod cluster;
pub mod counter;
pub mod instrumented;
pub mod lock;
pub mod progress;
pub mod repo_init;
pub mod reprocessing;
pub mod signals;
pub mod transactions;

pub use backend::memory::{MemoryCluster, MemoryCoordinationStore, MemoryLog};
pub use backend::postgres::{Database, MigrationRunner, PgCoordinationStore, PgDurableLog};
pub use cluster::{SingleInstanceLeadershipManager, StoreLeadershipManager};
pub use counter::DistributedCounter;
pub use instrumented::{InstrumentedNameLocker, InstrumentedTransactionManager};
pub use lock::{StoreCheckableLocker, StoreReadWriteLocker, StripedNameLocker};
pub use progress::StoreAllHandlesUpdaterSync;
pub use repo_init::StoreRepoInitProvider;
pub use reprocessing::{ErrorCatchingReprocessingQueue, LogReprocessingQueue};
pub use signals::{LogSignalWatcher, StoreSignalWatcher};
pub use transactions::StoreTransactionManager;
