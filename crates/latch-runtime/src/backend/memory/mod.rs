//! In-process backends. A [`MemoryCluster`] shared between several
//! [`MemoryCoordinationStore`] sessions behaves like a small cluster, which
//! is how the coordination algorithms are tested.

mod log;
mod store;

pub use log::{MemoryLog, DEFAULT_PARTITIONS};
pub use store::{MemoryCluster, MemoryCoordinationStore};
