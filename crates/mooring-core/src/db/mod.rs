//! Database layer for Mooring

mod checkpoint_store;
mod connection;
mod entity_store;
mod idempotency_store;
mod migrations;
mod operation_store;
mod version;

pub use checkpoint_store::{CheckpointStore, SqliteCheckpointStore};
pub use connection::Database;
pub use entity_store::{EntityStore, SqliteEntityStore};
pub use idempotency_store::{IdempotencyStore, SqliteIdempotencyStore};
pub use operation_store::{OperationStore, SqliteOperationStore, Transition};
pub use version::VersionAuthority;
