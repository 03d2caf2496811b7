//! Sync engine.
//!
//! Read path: [`DeltaEngine`] answers "what changed since my checkpoint".
//! Write path: [`queue`] stores client mutations, flags stale ones, and lets
//! a trusted applier commit or resolve them. [`update_with_version_check`]
//! is the direct-edit path guarded by a per-row lock version.

mod budget;
mod delta;
mod idempotency;
mod optimistic;
pub mod queue;
mod retention;
mod status;
mod visibility;

pub use budget::QueryBudget;
pub use delta::{
    plan, ChangeItem, ChangeOperation, DeltaEngine, DeltaMeta, DeltaRequest, DeltaResponse,
    DeltaStats, EntityDelta,
};
pub use idempotency::{CacheLookup, IdempotencyCache};
pub use optimistic::{update_with_version_check, VersionedUpdate};
pub use queue::{ApplyOutcome, ConflictInfo, OperationObserver, OutcomeError, SubmitOutcome};
pub use retention::{cleanup, CleanupReport};
pub use status::{sync_status, CheckpointStatus, SyncStatus};
pub use visibility::{OwnerVisibility, PublicVisibility, Visibility, VisibilityPolicy};
