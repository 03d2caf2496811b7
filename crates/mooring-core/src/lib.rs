//! mooring-core - Core library for Mooring
//!
//! This crate contains the models, the authoritative `SQLite` store, and the
//! sync engine (delta queries, pending operations, optimistic locking,
//! idempotency) used by the Mooring API server and admin CLI.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod sync;
pub mod util;

pub use config::SyncSettings;
pub use error::{Error, ErrorCode, Result};
pub use models::{EntityId, EntityKind, LockVersion, OperationId, VersionStamp};
pub use services::{Replayable, SyncService};
