//! Async facade over the sync engine shared by the API and the CLI.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::SyncSettings;
use crate::db::{Database, EntityStore, OperationStore, SqliteEntityStore, SqliteOperationStore};
use crate::models::{
    ConflictResolution, EntityId, EntityKind, EntityRecord, LockVersion, NewOperation,
    OperationId, PendingOperation,
};
use crate::sync::{
    self, queue, ApplyOutcome, CacheLookup, CleanupReport, DeltaEngine, DeltaRequest,
    DeltaResponse, IdempotencyCache, OperationObserver, OwnerVisibility, SubmitOutcome,
    SyncStatus, VersionedUpdate, VisibilityPolicy,
};
use crate::util::{duration_millis, fingerprint, now_millis};
use crate::{Error, Result};

/// A response that may have been served from the idempotency cache
#[derive(Debug, Clone, PartialEq)]
pub struct Replayable<T> {
    pub value: T,
    /// `true` when the response came from the cache and nothing executed
    pub replayed: bool,
}

/// Thread-safe service running every sync contract as one bounded
/// transaction on the blocking pool.
#[derive(Clone)]
pub struct SyncService {
    db: Arc<Mutex<Database>>,
    settings: SyncSettings,
    cache: IdempotencyCache,
    visibility: Arc<dyn VisibilityPolicy>,
    observer: Option<Arc<dyn OperationObserver>>,
}

impl SyncService {
    /// Wrap an opened database with the default owner-based visibility
    pub fn new(db: Database, settings: SyncSettings) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            cache: IdempotencyCache::new(settings.idempotency_ttl),
            settings,
            visibility: Arc::new(OwnerVisibility),
            observer: None,
        }
    }

    /// Open a service at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>, settings: SyncSettings) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = tokio::task::spawn_blocking(move || Database::open(&db_path))
            .await
            .map_err(|error| Error::Database(format!("database open task failed: {error}")))??;
        Ok(Self::new(db, settings))
    }

    /// Open an in-memory service (primarily for tests).
    pub fn open_in_memory(settings: SyncSettings) -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?, settings))
    }

    #[must_use]
    pub fn with_visibility(mut self, visibility: Arc<dyn VisibilityPolicy>) -> Self {
        self.visibility = visibility;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn OperationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Run `work` on the blocking pool while holding the database
    async fn run<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut db = Arc::clone(&self.db).lock_owned().await;
        tokio::task::spawn_blocking(move || work(&mut *db))
            .await
            .map_err(|error| Error::Database(format!("blocking task failed: {error}")))?
    }

    /// Run `work` at most once per idempotency key.
    ///
    /// Lookup, execution and recording happen under one database lock, so
    /// concurrent retries of the same key serialize and only the first runs.
    async fn run_once<T, F>(
        &self,
        key: Option<String>,
        identity: String,
        operation_name: &'static str,
        work: F,
    ) -> Result<Replayable<T>>
    where
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let Some(key) = key else {
            return self
                .run(work)
                .await
                .map(|value| Replayable {
                    value,
                    replayed: false,
                });
        };

        let cache = self.cache;
        self.run(move |db| {
            let conn = db.connection();
            if let CacheLookup::Hit(cached) =
                cache.check_or_record(conn, &key, &identity, operation_name, None)
            {
                match serde_json::from_value::<T>(cached) {
                    Ok(value) => {
                        tracing::debug!(
                            client = fingerprint(&identity),
                            operation = operation_name,
                            "Replayed idempotent response"
                        );
                        return Ok(Replayable {
                            value,
                            replayed: true,
                        });
                    }
                    Err(error) => tracing::warn!(
                        operation = operation_name,
                        "Ignoring unreadable cached response: {error}"
                    ),
                }
            }

            let value = work(&mut *db)?;
            match serde_json::to_value(&value) {
                Ok(response) => {
                    cache.check_or_record(
                        db.connection(),
                        &key,
                        &identity,
                        operation_name,
                        Some(&response),
                    );
                }
                Err(error) => tracing::warn!(
                    operation = operation_name,
                    "Response not cacheable: {error}"
                ),
            }
            Ok(Replayable {
                value,
                replayed: false,
            })
        })
        .await
    }

    fn notify(&self, outcome: &ApplyOutcome) {
        if let (Some(observer), Some(entity)) = (&self.observer, outcome.applied_entity()) {
            observer.operation_applied(&outcome.operation_id, entity);
        }
    }

    /// Pull changes since the client's checkpoints.
    pub async fn delta_sync(
        &self,
        client_id: &str,
        request: DeltaRequest,
    ) -> Result<DeltaResponse> {
        let client_id = client_id.to_string();
        let (kinds, limit) = sync::plan(&request, &self.settings);
        let visibility = Arc::clone(&self.visibility);
        let budget = self.settings.delta_budget;

        self.run(move |db| {
            DeltaEngine::new(visibility.as_ref(), budget).run(
                db.connection_mut(),
                &client_id,
                &kinds,
                limit,
            )
        })
        .await
    }

    /// Queue a client mutation, honoring an optional idempotency key.
    pub async fn submit_operation(
        &self,
        mut operation: NewOperation,
        idempotency_key: Option<String>,
    ) -> Result<Replayable<SubmitOutcome>> {
        operation.client_id = operation.client_id.trim().to_string();
        let identity = operation.client_id.clone();
        let visibility = Arc::clone(&self.visibility);
        self.run_once(idempotency_key, identity, "submit_operation", move |db| {
            queue::submit(db.connection_mut(), visibility.as_ref(), operation)
        })
        .await
    }

    /// Execute a pending operation. Trusted callers only.
    pub async fn apply_operation(&self, operation_id: OperationId) -> Result<ApplyOutcome> {
        let outcome = self
            .run(move |db| queue::apply(db.connection_mut(), &operation_id))
            .await?;
        self.notify(&outcome);
        Ok(outcome)
    }

    /// Settle a conflicting operation. Trusted callers only.
    pub async fn resolve_operation(
        &self,
        operation_id: OperationId,
        resolution: ConflictResolution,
    ) -> Result<ApplyOutcome> {
        let outcome = self
            .run(move |db| queue::resolve(db.connection_mut(), &operation_id, resolution))
            .await?;
        self.notify(&outcome);
        Ok(outcome)
    }

    /// Apply up to `limit` pending operations, oldest first.
    pub async fn apply_pending(&self, limit: usize) -> Result<Vec<ApplyOutcome>> {
        let outcomes = self
            .run(move |db| queue::apply_pending(db.connection_mut(), limit))
            .await?;
        for outcome in &outcomes {
            self.notify(outcome);
        }
        Ok(outcomes)
    }

    /// Abandon operations left pending or in conflict for longer than `older_than`.
    pub async fn abandon_stale(&self, older_than: Duration) -> Result<usize> {
        let cutoff = now_millis().saturating_sub(duration_millis(older_than));
        self.run(move |db| queue::abandon_stale(db.connection_mut(), cutoff))
            .await
    }

    /// Compare-and-swap update of one entity, honoring an optional idempotency key.
    pub async fn update_with_version_check(
        &self,
        identity: &str,
        kind: EntityKind,
        id: EntityId,
        expected: LockVersion,
        changes: Value,
        idempotency_key: Option<String>,
    ) -> Result<Replayable<VersionedUpdate>> {
        self.run_once(
            idempotency_key,
            identity.to_string(),
            "versioned_update",
            move |db| {
                sync::update_with_version_check(
                    db.connection_mut(),
                    kind,
                    &id,
                    expected,
                    &changes,
                )
            },
        )
        .await
    }

    pub async fn sync_status(&self, client_id: &str) -> Result<SyncStatus> {
        let client_id = client_id.to_string();
        self.run(move |db| sync::sync_status(db.connection(), &client_id))
            .await
    }

    /// Retention sweep over every store.
    pub async fn cleanup(&self, retention: Duration) -> Result<CleanupReport> {
        let cache = self.cache;
        self.run(move |db| sync::cleanup(db.connection_mut(), &cache, retention))
            .await
    }

    pub async fn get_operation(
        &self,
        operation_id: OperationId,
    ) -> Result<Option<PendingOperation>> {
        self.run(move |db| SqliteOperationStore::new(db.connection()).get(&operation_id))
            .await
    }

    /// A client's operations, newest first.
    pub async fn list_operations(
        &self,
        client_id: &str,
        limit: usize,
    ) -> Result<Vec<PendingOperation>> {
        let client_id = client_id.to_string();
        self.run(move |db| {
            SqliteOperationStore::new(db.connection()).list_for_client(&client_id, limit)
        })
        .await
    }

    pub async fn get_entity(
        &self,
        kind: EntityKind,
        id: EntityId,
    ) -> Result<Option<EntityRecord>> {
        self.run(move |db| SqliteEntityStore::new(db.connection()).get(kind, &id))
            .await
    }

    /// Insert an entity directly, bypassing the queue. Used for seeding.
    pub async fn create_entity(
        &self,
        kind: EntityKind,
        owner_id: &str,
        fields: Value,
    ) -> Result<EntityRecord> {
        let owner_id = owner_id.to_string();
        self.run(move |db| {
            let fields = crate::models::sanitize_fields(&fields)?;
            SqliteEntityStore::new(db.connection()).insert(
                kind,
                &EntityId::generate(),
                &owner_id,
                fields,
            )
        })
        .await
    }
}
