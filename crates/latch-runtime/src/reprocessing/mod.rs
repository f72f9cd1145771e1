mod fallback;
mod log_queue;

pub use fallback::ErrorCatchingReprocessingQueue;
pub use log_queue::LogReprocessingQueue;
