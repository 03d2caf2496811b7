//! Delta query engine.
//!
//! One call answers "what changed since my checkpoint" for each requested
//! entity type. The global version `V` is read once at the start, every
//! type is windowed to `(checkpoint, V]`, and results plus checkpoint
//! advances commit together.

use std::collections::BTreeMap;
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::budget::QueryBudget;
use super::VisibilityPolicy;
use crate::config::SyncSettings;
use crate::db::{
    CheckpointStore, EntityStore, SqliteCheckpointStore, SqliteEntityStore, VersionAuthority,
};
use crate::error::Result;
use crate::models::{EntityId, EntityKind, EntityRecord, VersionStamp};
use crate::util::{fingerprint, now_millis};

/// A pull request from one client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRequest {
    /// Types to sync; empty means every supported type
    #[serde(default)]
    pub entity_types: Vec<EntityKind>,
    /// Per-type page size; clamped by the engine
    #[serde(default)]
    pub limit: Option<usize>,
}

impl DeltaRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_types(entity_types: impl IntoIterator<Item = EntityKind>) -> Self {
        Self {
            entity_types: entity_types.into_iter().collect(),
            limit: None,
        }
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Requested types, deduplicated, in stable order
    fn kinds(&self) -> Vec<EntityKind> {
        if self.entity_types.is_empty() {
            return EntityKind::ALL.to_vec();
        }
        let mut kinds = self.entity_types.clone();
        kinds.sort_unstable();
        kinds.dedup();
        kinds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Upsert,
    Delete,
}

/// One changed row as seen by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeItem {
    pub id: EntityId,
    /// Domain fields; absent for deletions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Map<String, Value>>,
    pub version_stamp: VersionStamp,
    /// Server modification time, the value clients echo as `clientTimestamp`
    pub modified_at: i64,
    pub operation: ChangeOperation,
}

impl From<EntityRecord> for ChangeItem {
    fn from(record: EntityRecord) -> Self {
        let (fields, operation) = if record.is_deleted {
            (None, ChangeOperation::Delete)
        } else {
            (Some(record.data), ChangeOperation::Upsert)
        };
        Self {
            id: record.id,
            fields,
            version_stamp: record.version_stamp,
            modified_at: record.modified_at,
            operation,
        }
    }
}

/// Changes of one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDelta {
    pub items: Vec<ChangeItem>,
    pub has_more: bool,
    /// Checkpoint stored for this type after the call
    pub checkpoint: VersionStamp,
    /// The client had no checkpoint for this type, so deletions it missed
    /// may already be purged. Pages up to `has_more == false` are the
    /// complete visible set and replace the client's local rows.
    #[serde(default)]
    pub full_resync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaStats {
    pub total_changes: usize,
    pub current_version: VersionStamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaMeta {
    /// Server time of the call (Unix ms)
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaResponse {
    pub changes: BTreeMap<EntityKind, EntityDelta>,
    pub stats: DeltaStats,
    pub meta: DeltaMeta,
}

impl DeltaResponse {
    /// Whether any requested type still has rows beyond this page
    pub fn has_more(&self) -> bool {
        self.changes.values().any(|delta| delta.has_more)
    }
}

/// Computes deltas under a visibility policy and a time budget
pub struct DeltaEngine<'a> {
    policy: &'a dyn VisibilityPolicy,
    budget: Duration,
}

impl<'a> DeltaEngine<'a> {
    pub fn new(policy: &'a dyn VisibilityPolicy, budget: Duration) -> Self {
        Self { policy, budget }
    }

    /// Run one delta call; `limit` is the already-clamped page size.
    ///
    /// On timeout the transaction rolls back and no checkpoint moves.
    pub fn run(
        &self,
        conn: &mut Connection,
        client_id: &str,
        kinds: &[EntityKind],
        limit: usize,
    ) -> Result<DeltaResponse> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let budget = QueryBudget::arm(&tx, self.budget);

        let response = self
            .collect(&tx, client_id, kinds, limit, &budget)
            .map_err(|error| budget.map_err(error))?;
        drop(budget);
        tx.commit()?;

        tracing::debug!(
            client = fingerprint(client_id),
            total_changes = response.stats.total_changes,
            current_version = response.stats.current_version.get(),
            has_more = response.has_more(),
            "Delta sync complete"
        );
        Ok(response)
    }

    fn collect(
        &self,
        conn: &Connection,
        client_id: &str,
        kinds: &[EntityKind],
        limit: usize,
        budget: &QueryBudget<'_>,
    ) -> Result<DeltaResponse> {
        let current = VersionAuthority::new(conn).current()?;
        let entities = SqliteEntityStore::new(conn);
        let checkpoints = SqliteCheckpointStore::new(conn);
        let now = now_millis();

        let mut changes = BTreeMap::new();
        let mut total_changes = 0;

        for &kind in kinds {
            budget.check()?;

            let stored = checkpoints.get(client_id, kind)?;
            let full_resync = stored.is_none();
            let since = stored.map_or(VersionStamp::ZERO, |checkpoint| {
                checkpoint.last_synced_version
            });
            let visibility = self.policy.visibility(client_id, kind);

            let mut records =
                entities.changes_since(kind, &visibility, since, current, limit + 1)?;
            let has_more = records.len() > limit;
            records.truncate(limit);

            // A partial page only covers up to its last row
            let reached = match records.last() {
                Some(last) if has_more => last.version_stamp,
                _ => current,
            };
            let checkpoint = checkpoints
                .advance(client_id, kind, reached.max(since), now)?
                .last_synced_version;

            total_changes += records.len();
            changes.insert(
                kind,
                EntityDelta {
                    items: records.into_iter().map(ChangeItem::from).collect(),
                    has_more,
                    checkpoint,
                    full_resync,
                },
            );
        }

        Ok(DeltaResponse {
            changes,
            stats: DeltaStats {
                total_changes,
                current_version: current,
            },
            meta: DeltaMeta { timestamp: now },
        })
    }
}

/// Resolve the request's types and page size against engine limits
pub fn plan(request: &DeltaRequest, settings: &SyncSettings) -> (Vec<EntityKind>, usize) {
    (request.kinds(), settings.page_limit(request.limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::{OwnerVisibility, PublicVisibility, Visibility};
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn insert(db: &Database, kind: EntityKind, owner: &str) -> EntityRecord {
        SqliteEntityStore::new(db.connection())
            .insert(kind, &EntityId::generate(), owner, Map::new())
            .unwrap()
    }

    fn engine(policy: &dyn VisibilityPolicy) -> DeltaEngine<'_> {
        DeltaEngine::new(policy, Duration::from_secs(30))
    }

    #[test]
    fn empty_store_advances_to_zero() {
        let mut db = Database::open_in_memory().unwrap();
        let policy = PublicVisibility;

        let response = engine(&policy)
            .run(db.connection_mut(), "c", &EntityKind::ALL, 10)
            .unwrap();
        assert_eq!(response.stats.total_changes, 0);
        assert_eq!(response.changes.len(), 3);
        assert!(!response.has_more());
    }

    #[test]
    fn checkpoint_window_excludes_observed_rows() {
        let mut db = Database::open_in_memory().unwrap();
        let policy = PublicVisibility;

        insert(&db, EntityKind::Listing, "a");
        let first = engine(&policy)
            .run(db.connection_mut(), "c", &[EntityKind::Listing], 10)
            .unwrap();
        assert_eq!(first.stats.total_changes, 1);

        let second = engine(&policy)
            .run(db.connection_mut(), "c", &[EntityKind::Listing], 10)
            .unwrap();
        assert_eq!(second.stats.total_changes, 0);
        assert_eq!(
            second.changes[&EntityKind::Listing].checkpoint,
            first.stats.current_version
        );
        assert!(first.changes[&EntityKind::Listing].full_resync);
        assert!(!second.changes[&EntityKind::Listing].full_resync);
    }

    #[test]
    fn tombstones_are_reported_without_fields() {
        let mut db = Database::open_in_memory().unwrap();
        let policy = PublicVisibility;

        let record = insert(&db, EntityKind::Conversation, "a");
        SqliteEntityStore::new(db.connection())
            .tombstone(EntityKind::Conversation, &record.id)
            .unwrap();

        let response = engine(&policy)
            .run(db.connection_mut(), "c", &[EntityKind::Conversation], 10)
            .unwrap();
        let items = &response.changes[&EntityKind::Conversation].items;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, ChangeOperation::Delete);
        assert!(items[0].fields.is_none());
    }

    #[test]
    fn pagination_delivers_every_row_exactly_once() {
        let mut db = Database::open_in_memory().unwrap();
        let policy = PublicVisibility;

        let mut expected = HashSet::new();
        for i in 0..7 {
            let kind = if i % 2 == 0 {
                EntityKind::Listing
            } else {
                EntityKind::Notification
            };
            let record = insert(&db, kind, "a");
            expected.insert((record.id.clone(), record.version_stamp));
        }

        let mut seen = HashSet::new();
        let mut previous_checkpoint = VersionStamp::ZERO;
        loop {
            let response = engine(&policy)
                .run(
                    db.connection_mut(),
                    "c",
                    &[EntityKind::Listing, EntityKind::Notification],
                    2,
                )
                .unwrap();
            for delta in response.changes.values() {
                for item in &delta.items {
                    assert!(seen.insert((item.id.clone(), item.version_stamp)));
                    assert!(delta.checkpoint >= item.version_stamp);
                }
            }
            let listing_checkpoint = response.changes[&EntityKind::Listing].checkpoint;
            assert!(listing_checkpoint >= previous_checkpoint);
            previous_checkpoint = listing_checkpoint;
            if !response.has_more() {
                break;
            }
        }
        assert_eq!(seen, expected);
    }

    #[test]
    fn visibility_filters_private_types() {
        let mut db = Database::open_in_memory().unwrap();
        let policy = OwnerVisibility;

        insert(&db, EntityKind::Notification, "alice");
        insert(&db, EntityKind::Notification, "bob");
        insert(&db, EntityKind::Listing, "bob");

        let response = engine(&policy)
            .run(db.connection_mut(), "alice", &EntityKind::ALL, 10)
            .unwrap();
        assert_eq!(response.changes[&EntityKind::Notification].items.len(), 1);
        assert_eq!(response.changes[&EntityKind::Listing].items.len(), 1);
    }

    #[test]
    fn timeout_rolls_back_checkpoints() {
        let mut db = Database::open_in_memory().unwrap();
        let policy = PublicVisibility;
        insert(&db, EntityKind::Listing, "a");

        let error = DeltaEngine::new(&policy, Duration::ZERO)
            .run(db.connection_mut(), "c", &[EntityKind::Listing], 10)
            .unwrap_err();
        assert!(matches!(error, crate::Error::Timeout(_)));

        let checkpoint = SqliteCheckpointStore::new(db.connection())
            .get("c", EntityKind::Listing)
            .unwrap();
        assert!(checkpoint.is_none());
    }

    /// Stalls when asked about one entity type
    struct StallOn(EntityKind, Duration);

    impl VisibilityPolicy for StallOn {
        fn visibility(&self, _client_id: &str, kind: EntityKind) -> Visibility {
            if kind == self.0 {
                std::thread::sleep(self.1);
            }
            Visibility::Everyone
        }
    }

    #[test]
    fn timeout_after_first_type_keeps_its_checkpoint_unset() {
        let mut db = Database::open_in_memory().unwrap();
        insert(&db, EntityKind::Listing, "a");
        insert(&db, EntityKind::Conversation, "a");
        let policy = StallOn(EntityKind::Conversation, Duration::from_millis(400));

        let error = DeltaEngine::new(&policy, Duration::from_millis(200))
            .run(
                db.connection_mut(),
                "c",
                &[
                    EntityKind::Listing,
                    EntityKind::Conversation,
                    EntityKind::Notification,
                ],
                10,
            )
            .unwrap_err();
        assert!(matches!(error, crate::Error::Timeout(_)));

        let checkpoints = SqliteCheckpointStore::new(db.connection());
        for kind in EntityKind::ALL {
            assert!(checkpoints.get("c", kind).unwrap().is_none());
        }
    }

    #[test]
    fn plan_applies_defaults() {
        let settings = SyncSettings::default();
        let (kinds, limit) = plan(&DeltaRequest::all().with_limit(9_999_999), &settings);
        assert_eq!(kinds.len(), 3);
        assert_eq!(limit, settings.max_page_size);
    }

    #[test]
    fn request_kinds_are_deduplicated() {
        let request = DeltaRequest::for_types([
            EntityKind::Notification,
            EntityKind::Listing,
            EntityKind::Notification,
        ]);
        assert_eq!(
            request.kinds(),
            vec![EntityKind::Listing, EntityKind::Notification]
        );
        assert_eq!(DeltaRequest::all().kinds(), EntityKind::ALL.to_vec());
    }

    #[test]
    fn response_serializes_with_type_keys() {
        let response = DeltaResponse {
            changes: BTreeMap::from([(
                EntityKind::Listing,
                EntityDelta {
                    items: Vec::new(),
                    has_more: false,
                    checkpoint: VersionStamp::new(3),
                    full_resync: true,
                },
            )]),
            stats: DeltaStats {
                total_changes: 0,
                current_version: VersionStamp::new(3),
            },
            meta: DeltaMeta { timestamp: 1 },
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["changes"]["listings"]["hasMore"], Value::Bool(false));
        assert_eq!(json["changes"]["listings"]["fullResync"], Value::Bool(true));
        assert_eq!(json["stats"]["currentVersion"], serde_json::json!(3));
    }
}
