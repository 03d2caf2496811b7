//! Pending operation repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::Result;
use crate::models::{
    ConflictResolution, OperationId, OperationStatus, OperationType, PendingOperation,
};

const OPERATION_COLUMNS: &str = "id, client_id, op_type, entity_type, entity_id, payload, \
     client_timestamp, server_received_at, status, conflict_resolution, error_message, applied_at";

/// A guarded status change: only applies while the row is still in `from`
#[derive(Debug, Clone)]
pub struct Transition<'a> {
    pub from: OperationStatus,
    pub to: OperationStatus,
    pub error_message: Option<&'a str>,
    pub resolution: Option<ConflictResolution>,
    pub applied_at: Option<i64>,
}

impl Transition<'_> {
    pub const fn new(from: OperationStatus, to: OperationStatus) -> Self {
        Self {
            from,
            to,
            error_message: None,
            resolution: None,
            applied_at: None,
        }
    }
}

/// Storage operations for the pending operation queue
pub trait OperationStore {
    fn insert(&self, operation: &PendingOperation) -> Result<()>;

    fn get(&self, id: &OperationId) -> Result<Option<PendingOperation>>;

    /// Apply a status transition; `false` when the row was not in `from`
    fn transition(&self, id: &OperationId, transition: &Transition<'_>) -> Result<bool>;

    /// Operations in `status`, oldest received first
    fn list_by_status(&self, status: OperationStatus, limit: usize)
        -> Result<Vec<PendingOperation>>;

    /// A client's operations, newest received first
    fn list_for_client(&self, client_id: &str, limit: usize) -> Result<Vec<PendingOperation>>;

    /// Operations of a client still waiting on the applier or a resolution
    fn count_open(&self, client_id: &str) -> Result<usize>;

    /// Move pending and conflict operations received before `cutoff_ms` to `abandoned`
    fn abandon_older_than(&self, cutoff_ms: i64) -> Result<usize>;

    /// Delete terminal operations received before `cutoff_ms`
    fn purge_terminal(&self, cutoff_ms: i64) -> Result<usize>;
}

/// `SQLite` implementation of `OperationStore`
pub struct SqliteOperationStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteOperationStore<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn conversion_error(column: usize, error: crate::Error) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(error))
    }

    /// Parse an operation from a database row
    fn parse_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingOperation> {
        let id: String = row.get(0)?;
        let op_type: String = row.get(2)?;
        let entity_type: String = row.get(3)?;
        let entity_id: Option<String> = row.get(4)?;
        let status: String = row.get(8)?;
        let resolution: Option<String> = row.get(9)?;

        Ok(PendingOperation {
            id: id.parse().map_err(|e| Self::conversion_error(0, e))?,
            client_id: row.get(1)?,
            op_type: op_type
                .parse::<OperationType>()
                .map_err(|e| Self::conversion_error(2, e))?,
            entity_kind: entity_type
                .parse()
                .map_err(|e| Self::conversion_error(3, e))?,
            entity_id: entity_id
                .map(|value| value.parse())
                .transpose()
                .map_err(|e| Self::conversion_error(4, e))?,
            payload: row.get::<_, Value>(5)?,
            client_timestamp: row.get(6)?,
            server_received_at: row.get(7)?,
            status: status.parse().map_err(|e| Self::conversion_error(8, e))?,
            conflict_resolution: resolution
                .map(|value| value.parse())
                .transpose()
                .map_err(|e| Self::conversion_error(9, e))?,
            error_message: row.get(10)?,
            applied_at: row.get(11)?,
        })
    }
}

impl OperationStore for SqliteOperationStore<'_> {
    fn insert(&self, operation: &PendingOperation) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO pending_operations ({OPERATION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                operation.id.as_str(),
                operation.client_id,
                operation.op_type.as_str(),
                operation.entity_kind.as_str(),
                operation.entity_id.as_ref().map(|id| id.as_str().to_string()),
                operation.payload,
                operation.client_timestamp,
                operation.server_received_at,
                operation.status.as_str(),
                operation.conflict_resolution.map(ConflictResolution::as_str),
                operation.error_message,
                operation.applied_at,
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &OperationId) -> Result<Option<PendingOperation>> {
        let operation = self
            .conn
            .query_row(
                &format!("SELECT {OPERATION_COLUMNS} FROM pending_operations WHERE id = ?"),
                params![id.as_str()],
                Self::parse_operation,
            )
            .optional()?;
        Ok(operation)
    }

    fn transition(&self, id: &OperationId, transition: &Transition<'_>) -> Result<bool> {
        if !transition.from.can_transition_to(transition.to) {
            return Err(crate::Error::InvalidInput(format!(
                "illegal operation transition {} -> {}",
                transition.from, transition.to
            )));
        }

        let rows = self.conn.execute(
            "UPDATE pending_operations
             SET status = ?1,
                 error_message = COALESCE(?2, error_message),
                 conflict_resolution = COALESCE(?3, conflict_resolution),
                 applied_at = COALESCE(?4, applied_at)
             WHERE id = ?5 AND status = ?6",
            params![
                transition.to.as_str(),
                transition.error_message,
                transition.resolution.map(ConflictResolution::as_str),
                transition.applied_at,
                id.as_str(),
                transition.from.as_str(),
            ],
        )?;
        Ok(rows > 0)
    }

    fn list_by_status(
        &self,
        status: OperationStatus,
        limit: usize,
    ) -> Result<Vec<PendingOperation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_operations
             WHERE status = ?
             ORDER BY server_received_at ASC, id ASC
             LIMIT ?"
        ))?;

        let operations = stmt
            .query_map(params![status.as_str(), limit as i64], Self::parse_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }

    fn list_for_client(&self, client_id: &str, limit: usize) -> Result<Vec<PendingOperation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_operations
             WHERE client_id = ?
             ORDER BY server_received_at DESC, id DESC
             LIMIT ?"
        ))?;

        let operations = stmt
            .query_map(params![client_id, limit as i64], Self::parse_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }

    fn count_open(&self, client_id: &str) -> Result<usize> {
        let count: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_operations
             WHERE client_id = ? AND status IN ('pending', 'conflict')",
            params![client_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn abandon_older_than(&self, cutoff_ms: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE pending_operations
             SET status = 'abandoned',
                 error_message = COALESCE(error_message, 'abandoned after retention window')
             WHERE status IN ('pending', 'conflict') AND server_received_at < ?",
            params![cutoff_ms],
        )?;
        Ok(rows)
    }

    fn purge_terminal(&self, cutoff_ms: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM pending_operations
             WHERE status IN ('applied', 'rejected', 'resolved', 'abandoned')
               AND server_received_at < ?",
            params![cutoff_ms],
        )?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{EntityId, EntityKind};
    use serde_json::json;

    fn operation(client_id: &str, received_at: i64) -> PendingOperation {
        PendingOperation {
            id: OperationId::new(),
            client_id: client_id.to_string(),
            op_type: OperationType::Update,
            entity_kind: EntityKind::Listing,
            entity_id: Some(EntityId::generate()),
            payload: json!({"title": "Desk"}),
            client_timestamp: received_at - 10,
            server_received_at: received_at,
            status: OperationStatus::Pending,
            conflict_resolution: None,
            error_message: None,
            applied_at: None,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteOperationStore::new(db.connection());
        let op = operation("client", 1_000);

        store.insert(&op).unwrap();
        let fetched = store.get(&op.id).unwrap().unwrap();
        assert_eq!(fetched, op);
    }

    #[test]
    fn test_transition_is_guarded_by_current_status() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteOperationStore::new(db.connection());
        let op = operation("client", 1_000);
        store.insert(&op).unwrap();

        let mut applied = Transition::new(OperationStatus::Pending, OperationStatus::Applied);
        applied.applied_at = Some(2_000);
        assert!(store.transition(&op.id, &applied).unwrap());
        // Second attempt finds the row no longer pending
        assert!(!store.transition(&op.id, &applied).unwrap());

        let fetched = store.get(&op.id).unwrap().unwrap();
        assert_eq!(fetched.status, OperationStatus::Applied);
        assert_eq!(fetched.applied_at, Some(2_000));
    }

    #[test]
    fn test_illegal_transition_is_refused() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteOperationStore::new(db.connection());
        let op = operation("client", 1_000);
        store.insert(&op).unwrap();

        let result = store.transition(
            &op.id,
            &Transition::new(OperationStatus::Applied, OperationStatus::Pending),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_listing_and_counting() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteOperationStore::new(db.connection());

        let first = operation("a", 1_000);
        let second = operation("a", 2_000);
        let other = operation("b", 1_500);
        for op in [&second, &first, &other] {
            store.insert(op).unwrap();
        }

        let pending = store.list_by_status(OperationStatus::Pending, 10).unwrap();
        let order: Vec<i64> = pending.iter().map(|op| op.server_received_at).collect();
        assert_eq!(order, vec![1_000, 1_500, 2_000]);

        let mine = store.list_for_client("a", 10).unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].id, second.id);
        assert_eq!(store.count_open("a").unwrap(), 2);
    }

    #[test]
    fn test_abandon_and_purge() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteOperationStore::new(db.connection());

        let old = operation("a", 1_000);
        let fresh = operation("a", 9_000);
        store.insert(&old).unwrap();
        store.insert(&fresh).unwrap();

        assert_eq!(store.abandon_older_than(5_000).unwrap(), 1);
        let abandoned = store.get(&old.id).unwrap().unwrap();
        assert_eq!(abandoned.status, OperationStatus::Abandoned);
        assert!(abandoned.error_message.is_some());

        assert_eq!(store.purge_terminal(5_000).unwrap(), 1);
        assert!(store.get(&old.id).unwrap().is_none());
        assert!(store.get(&fresh.id).unwrap().is_some());
    }
}
