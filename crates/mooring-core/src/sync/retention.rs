//! Retention sweep, driven by an external scheduler

use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};

use super::IdempotencyCache;
use crate::db::{
    CheckpointStore, EntityStore, OperationStore, SqliteCheckpointStore, SqliteEntityStore,
    SqliteOperationStore,
};
use crate::error::Result;
use crate::models::EntityKind;
use crate::util::{duration_millis, now_millis};

/// Rows removed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub idempotency_records: usize,
    pub operations: usize,
    pub checkpoints: usize,
    pub tombstones: usize,
}

impl CleanupReport {
    pub const fn total(&self) -> usize {
        self.idempotency_records + self.operations + self.checkpoints + self.tombstones
    }
}

/// Purge everything older than `retention`: expired idempotency records,
/// terminal operations, idle checkpoints and tombstones.
pub fn cleanup(
    conn: &mut Connection,
    cache: &IdempotencyCache,
    retention: Duration,
) -> Result<CleanupReport> {
    let cutoff = now_millis().saturating_sub(duration_millis(retention));
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let idempotency_records = cache.cleanup(&tx, retention);
    let operations = SqliteOperationStore::new(&tx).purge_terminal(cutoff)?;
    let checkpoints = SqliteCheckpointStore::new(&tx).purge_stale(cutoff)?;
    let entities = SqliteEntityStore::new(&tx);
    let mut tombstones = 0;
    for kind in EntityKind::ALL {
        tombstones += entities.purge_tombstones(kind, cutoff)?;
    }
    tx.commit()?;

    let report = CleanupReport {
        idempotency_records,
        operations,
        checkpoints,
        tombstones,
    };
    tracing::info!(
        idempotency_records,
        operations,
        checkpoints,
        tombstones,
        retention_secs = retention.as_secs(),
        "Retention sweep complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{EntityId, VersionStamp};
    use crate::sync::{DeltaEngine, PublicVisibility};
    use serde_json::Map;

    #[test]
    fn sweep_removes_only_expired_state() {
        let mut db = Database::open_in_memory().unwrap();
        {
            let conn = db.connection();
            let entities = SqliteEntityStore::new(conn);
            let dead = EntityId::generate();
            entities
                .insert(EntityKind::Listing, &dead, "a", Map::new())
                .unwrap();
            entities
                .insert(EntityKind::Listing, &EntityId::generate(), "a", Map::new())
                .unwrap();
            entities.tombstone(EntityKind::Listing, &dead).unwrap();

            let checkpoints = SqliteCheckpointStore::new(conn);
            checkpoints
                .advance("idle", EntityKind::Listing, VersionStamp::new(1), 0)
                .unwrap();
            checkpoints
                .advance("active", EntityKind::Listing, VersionStamp::new(1), now_millis())
                .unwrap();
        }

        let cache = IdempotencyCache::new(Duration::from_secs(60));
        let report = cleanup(db.connection_mut(), &cache, Duration::from_secs(3_600)).unwrap();
        assert_eq!(report.checkpoints, 1);
        // The tombstone is fresh, so it survives
        assert_eq!(report.tombstones, 0);
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn purged_checkpoint_forces_full_resync() {
        let mut db = Database::open_in_memory().unwrap();
        let policy = PublicVisibility;
        let engine = DeltaEngine::new(&policy, Duration::from_secs(30));
        let kinds = [EntityKind::Listing];

        let gone = EntityId::generate();
        SqliteEntityStore::new(db.connection())
            .insert(EntityKind::Listing, &gone, "a", Map::new())
            .unwrap();
        engine.run(db.connection_mut(), "c", &kinds, 10).unwrap();
        {
            let conn = db.connection();
            SqliteEntityStore::new(conn)
                .tombstone(EntityKind::Listing, &gone)
                .unwrap();
            conn.execute("UPDATE listings SET modified_at = 0", [])
                .unwrap();
            conn.execute("UPDATE sync_checkpoints SET last_synced_at = 0", [])
                .unwrap();
        }

        let cache = IdempotencyCache::new(Duration::from_secs(60));
        let report = cleanup(db.connection_mut(), &cache, Duration::from_secs(3_600)).unwrap();
        assert_eq!(report.checkpoints, 1);
        assert_eq!(report.tombstones, 1);

        let response = engine.run(db.connection_mut(), "c", &kinds, 10).unwrap();
        let listings = &response.changes[&EntityKind::Listing];
        assert!(listings.items.is_empty());
        assert!(listings.full_resync);
    }
}
