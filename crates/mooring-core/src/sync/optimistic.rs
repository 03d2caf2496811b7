//! Optimistic-lock update helper.
//!
//! Independent of the sync clock: the caller names the `lock_version` it
//! last read and the write only lands if nobody else wrote in between.

use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{EntityStore, SqliteEntityStore};
use crate::error::{ErrorCode, Result};
use crate::models::{merge_fields, sanitize_fields, EntityId, EntityKind, LockVersion, VersionStamp};

/// Outcome of a compare-and-swap update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VersionedUpdate {
    #[serde(rename_all = "camelCase")]
    Updated {
        new_version: LockVersion,
        version_stamp: VersionStamp,
    },
    #[serde(rename_all = "camelCase")]
    VersionConflict {
        expected: LockVersion,
        actual: LockVersion,
    },
    NotFound,
}

impl VersionedUpdate {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Updated { .. })
    }

    /// Error code for unsuccessful outcomes
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Updated { .. } => None,
            Self::VersionConflict { .. } => Some(ErrorCode::VersionConflict),
            Self::NotFound => Some(ErrorCode::NotFound),
        }
    }
}

/// Merge `changes` into a live row if its lock version is still `expected`.
pub fn update_with_version_check(
    conn: &mut Connection,
    kind: EntityKind,
    id: &EntityId,
    expected: LockVersion,
    changes: &Value,
) -> Result<VersionedUpdate> {
    let changes = sanitize_fields(changes)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let store = SqliteEntityStore::new(&tx);

    let Some(current) = store.get(kind, id)?.filter(|record| !record.is_deleted) else {
        return Ok(VersionedUpdate::NotFound);
    };
    if current.lock_version != expected {
        tracing::debug!(
            entity = %kind,
            id = %id,
            expected = expected.get(),
            actual = current.lock_version.get(),
            "Lock version mismatch"
        );
        return Ok(VersionedUpdate::VersionConflict {
            expected,
            actual: current.lock_version,
        });
    }

    let mut data = current.data;
    merge_fields(&mut data, changes);

    let outcome = match store.compare_and_swap(kind, id, expected, data)? {
        Some(record) => VersionedUpdate::Updated {
            new_version: record.lock_version,
            version_stamp: record.version_stamp,
        },
        None => {
            // Lost the race between read and write; report what won
            let actual = store
                .get(kind, id)?
                .map_or(expected, |record| record.lock_version);
            VersionedUpdate::VersionConflict { expected, actual }
        }
    };

    if outcome.is_success() {
        tx.commit()?;
    }
    Ok(outcome)
}
