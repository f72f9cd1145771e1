//! Distributed locks built on ephemeral store records.

mod checkable;
mod monitor;
mod mutex;
mod read_write;
mod striped;

pub use checkable::StoreCheckableLocker;
pub use monitor::ConnectionMonitor;
pub use mutex::StoreMutex;
pub use read_write::StoreReadWriteLocker;
pub use striped::{stripe_index, StripedNameLocker, STRIPE_COUNT};
