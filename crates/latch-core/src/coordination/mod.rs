//! Narrow interfaces handed to collaborators. Storage, ACL and request
//! layers depend on these, never on a backend.

mod leadership;
mod locker;
mod progress;
mod reprocessing;
mod repo_init;
mod signals;
mod transactions;

pub use leadership::{LeadershipManager, MembershipListener};
pub use locker::{CheckableLocker, NameLocker, ReadWriteLocker};
pub use progress::{AllHandlesUpdaterSync, UpdateStatus};
pub use reprocessing::{ReplayHandler, TransactionReprocessingQueue};
pub use repo_init::RepoInitProvider;
pub use signals::{SignalListener, SignalWatcher};
pub use transactions::TransactionManager;
