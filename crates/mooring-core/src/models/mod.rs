//! Data models for Mooring

mod checkpoint;
mod entity;
mod idempotency;
mod pending_operation;

pub use checkpoint::SyncCheckpoint;
pub use entity::{
    merge_fields, sanitize_fields, EntityId, EntityKind, EntityRecord, LockVersion, VersionStamp,
    RESERVED_FIELDS,
};
pub use idempotency::IdempotencyRecord;
pub use pending_operation::{
    ConflictResolution, NewOperation, OperationId, OperationStatus, OperationType,
    PendingOperation,
};
