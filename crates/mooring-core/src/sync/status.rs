//! Per-client sync status

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::{
    CheckpointStore, OperationStore, SqliteCheckpointStore, SqliteOperationStore, VersionAuthority,
};
use crate::error::Result;
use crate::models::{EntityKind, VersionStamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointStatus {
    pub last_version: VersionStamp,
    /// Unix ms
    pub last_sync_at: i64,
    /// Global stamps issued since the checkpoint, across all types
    pub behind_by: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub current_version: VersionStamp,
    pub checkpoints: BTreeMap<EntityKind, CheckpointStatus>,
    /// Operations still pending or in conflict
    pub pending_operations: usize,
}

/// Read-only snapshot of how far a client lags the store
pub fn sync_status(conn: &Connection, client_id: &str) -> Result<SyncStatus> {
    let current_version = VersionAuthority::new(conn).current()?;
    let checkpoints = SqliteCheckpointStore::new(conn)
        .list(client_id)?
        .into_iter()
        .map(|checkpoint| {
            let behind_by = current_version
                .get()
                .saturating_sub(checkpoint.last_synced_version.get())
                .max(0);
            (
                checkpoint.entity_kind,
                CheckpointStatus {
                    last_version: checkpoint.last_synced_version,
                    last_sync_at: checkpoint.last_synced_at,
                    behind_by,
                },
            )
        })
        .collect();
    let pending_operations = SqliteOperationStore::new(conn).count_open(client_id)?;

    Ok(SyncStatus {
        current_version,
        checkpoints,
        pending_operations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, EntityStore, SqliteEntityStore};
    use crate::models::EntityId;
    use serde_json::Map;

    #[test]
    fn unknown_client_has_no_checkpoints() {
        let db = Database::open_in_memory().unwrap();
        let status = sync_status(db.connection(), "nobody").unwrap();
        assert_eq!(status.current_version, VersionStamp::ZERO);
        assert!(status.checkpoints.is_empty());
        assert_eq!(status.pending_operations, 0);
    }

    #[test]
    fn behind_by_is_global_distance() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        SqliteCheckpointStore::new(conn)
            .advance("c", EntityKind::Listing, VersionStamp::ZERO, 10)
            .unwrap();
        let entities = SqliteEntityStore::new(conn);
        for kind in EntityKind::ALL {
            entities
                .insert(kind, &EntityId::generate(), "c", Map::new())
                .unwrap();
        }

        let status = sync_status(conn, "c").unwrap();
        assert_eq!(status.current_version, VersionStamp::new(3));
        let listing = status.checkpoints[&EntityKind::Listing];
        assert_eq!(listing.behind_by, 3);
        assert_eq!(listing.last_sync_at, 10);
    }
}
