mod dispatch;
mod log;
mod store;

pub use log::LogSignalWatcher;
pub use store::{StoreSignalWatcher, SIGNALS_KEY};
