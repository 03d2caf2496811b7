//! Idempotency key storage

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::Result;
use crate::models::IdempotencyRecord;

/// Storage operations for cached idempotent responses
pub trait IdempotencyStore {
    fn get(&self, key: &str, identity: &str) -> Result<Option<IdempotencyRecord>>;

    /// Store a record unless a live one already holds the key.
    ///
    /// Returns `false` when an unexpired record won; expired records are
    /// overwritten.
    fn put(&self, record: &IdempotencyRecord) -> Result<bool>;

    /// Remove records expired at `now_ms` or created before `created_before_ms`
    fn purge(&self, now_ms: i64, created_before_ms: i64) -> Result<usize>;
}

/// `SQLite` implementation of `IdempotencyStore`
pub struct SqliteIdempotencyStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteIdempotencyStore<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdempotencyRecord> {
        Ok(IdempotencyRecord {
            key: row.get(0)?,
            identity: row.get(1)?,
            operation_name: row.get(2)?,
            cached_response: row.get::<_, Value>(3)?,
            created_at: row.get(4)?,
            expires_at: row.get(5)?,
        })
    }
}

impl IdempotencyStore for SqliteIdempotencyStore<'_> {
    fn get(&self, key: &str, identity: &str) -> Result<Option<IdempotencyRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT key, identity, operation_name, cached_response, created_at, expires_at
                 FROM idempotency_keys
                 WHERE key = ? AND identity = ?",
                params![key, identity],
                Self::parse_record,
            )
            .optional()?;
        Ok(record)
    }

    fn put(&self, record: &IdempotencyRecord) -> Result<bool> {
        let rows = self.conn.execute(
            "INSERT INTO idempotency_keys (key, identity, operation_name, cached_response, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (key, identity) DO UPDATE SET
                operation_name = excluded.operation_name,
                cached_response = excluded.cached_response,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
             WHERE idempotency_keys.expires_at <= excluded.created_at",
            params![
                record.key,
                record.identity,
                record.operation_name,
                record.cached_response,
                record.created_at,
                record.expires_at,
            ],
        )?;
        Ok(rows > 0)
    }

    fn purge(&self, now_ms: i64, created_before_ms: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM idempotency_keys WHERE expires_at <= ?1 OR created_at < ?2",
            params![now_ms, created_before_ms],
        )?;
        Ok(rows)
    }
}
