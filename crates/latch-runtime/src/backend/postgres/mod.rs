//! PostgreSQL backend: a coordination store and a durable log sharing one pool.

mod log;
mod migrations;
mod pool;
mod store;

pub use log::{PgDurableLog, PgLogConsumer, LOG_CHANNEL};
pub use migrations::{builtin_migrations, Migration, MigrationRunner};
pub use pool::Database;
pub use store::{PgCoordinationStore, RECORDS_CHANNEL};
