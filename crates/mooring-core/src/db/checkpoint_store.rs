//! Sync checkpoint store

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::{EntityKind, SyncCheckpoint, VersionStamp};

/// Per-(client, entity type) progress of the delta engine
pub trait CheckpointStore {
    /// Get the checkpoint, `None` when the pair has never synced
    fn get(&self, client_id: &str, kind: EntityKind) -> Result<Option<SyncCheckpoint>>;

    /// Move the checkpoint forward; never moves it backward
    fn advance(
        &self,
        client_id: &str,
        kind: EntityKind,
        version: VersionStamp,
        synced_at: i64,
    ) -> Result<SyncCheckpoint>;

    /// All checkpoints recorded for a client
    fn list(&self, client_id: &str) -> Result<Vec<SyncCheckpoint>>;

    /// Drop checkpoints not touched since `cutoff_ms`
    fn purge_stale(&self, cutoff_ms: i64) -> Result<usize>;
}

/// `SQLite` implementation of `CheckpointStore`
pub struct SqliteCheckpointStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteCheckpointStore<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncCheckpoint> {
        let entity_type: String = row.get(1)?;
        let entity_kind = entity_type.parse().map_err(|error: crate::Error| {
            rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(error))
        })?;
        Ok(SyncCheckpoint {
            client_id: row.get(0)?,
            entity_kind,
            last_synced_version: VersionStamp::new(row.get(2)?),
            last_synced_at: row.get(3)?,
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore<'_> {
    fn get(&self, client_id: &str, kind: EntityKind) -> Result<Option<SyncCheckpoint>> {
        let checkpoint = self
            .conn
            .query_row(
                "SELECT client_id, entity_type, last_synced_version, last_synced_at
                 FROM sync_checkpoints
                 WHERE client_id = ? AND entity_type = ?",
                params![client_id, kind.as_str()],
                Self::parse_checkpoint,
            )
            .optional()?;
        Ok(checkpoint)
    }

    fn advance(
        &self,
        client_id: &str,
        kind: EntityKind,
        version: VersionStamp,
        synced_at: i64,
    ) -> Result<SyncCheckpoint> {
        self.conn.execute(
            "INSERT INTO sync_checkpoints (client_id, entity_type, last_synced_version, last_synced_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (client_id, entity_type) DO UPDATE SET
                last_synced_version = MAX(last_synced_version, excluded.last_synced_version),
                last_synced_at = excluded.last_synced_at",
            params![client_id, kind.as_str(), version.get(), synced_at],
        )?;

        self.get(client_id, kind)?.ok_or_else(|| {
            crate::Error::Database(format!("checkpoint for {kind} vanished after upsert"))
        })
    }

    fn list(&self, client_id: &str) -> Result<Vec<SyncCheckpoint>> {
        let mut stmt = self.conn.prepare(
            "SELECT client_id, entity_type, last_synced_version, last_synced_at
             FROM sync_checkpoints
             WHERE client_id = ?
             ORDER BY entity_type ASC",
        )?;

        let checkpoints = stmt
            .query_map(params![client_id], Self::parse_checkpoint)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(checkpoints)
    }

    fn purge_stale(&self, cutoff_ms: i64) -> Result<usize> {
        let purged = self.conn.execute(
            "DELETE FROM sync_checkpoints WHERE last_synced_at < ?",
            params![cutoff_ms],
        )?;
        Ok(purged)
    }
}
