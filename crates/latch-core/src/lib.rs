pub mod alert;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod coordination;
pub mod error;
pub mod signal;
pub mod store;
pub mod transaction;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use alert::{Alerter, LogAlerter};
pub use clock::{Clock, SystemClock};
pub use cluster::{LeadershipState, NodeId};
pub use config::LatchConfig;
pub use error::{LatchError, Result};
pub use signal::Signal;
pub use store::{CoordinationStore, DurableLog};
pub use transaction::{Transaction, TxnId, TxnOp};
