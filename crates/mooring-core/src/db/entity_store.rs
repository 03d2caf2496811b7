//! Versioned entity store

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

use super::VersionAuthority;
use crate::error::{Error, Result};
use crate::models::{
    merge_fields, EntityId, EntityKind, EntityRecord, LockVersion, VersionStamp,
};
use crate::sync::Visibility;
use crate::util::now_millis;

const ENTITY_COLUMNS: &str =
    "id, owner_id, data, created_at, modified_at, version_stamp, lock_version, is_deleted";

/// Storage operations on syncable tables.
///
/// Every write path stamps the row with a fresh [`VersionStamp`] and the
/// server clock, and bumps the row's [`LockVersion`]. Callers cannot supply
/// either value.
pub trait EntityStore {
    /// Insert a new row owned by `owner_id`
    fn insert(
        &self,
        kind: EntityKind,
        id: &EntityId,
        owner_id: &str,
        fields: Map<String, Value>,
    ) -> Result<EntityRecord>;

    /// Get a row by id, tombstones included
    fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<EntityRecord>>;

    /// Merge `changes` into a live row
    fn update(
        &self,
        kind: EntityKind,
        id: &EntityId,
        changes: Map<String, Value>,
    ) -> Result<EntityRecord>;

    /// Replace a live row's fields only if its lock version still matches.
    ///
    /// Returns `None` when the conditional write touched no row.
    fn compare_and_swap(
        &self,
        kind: EntityKind,
        id: &EntityId,
        expected: LockVersion,
        fields: Map<String, Value>,
    ) -> Result<Option<EntityRecord>>;

    /// Logically delete a live row
    fn tombstone(&self, kind: EntityKind, id: &EntityId) -> Result<EntityRecord>;

    /// Rows with `after < version_stamp <= upto`, oldest stamp first
    fn changes_since(
        &self,
        kind: EntityKind,
        visibility: &Visibility,
        after: VersionStamp,
        upto: VersionStamp,
        limit: usize,
    ) -> Result<Vec<EntityRecord>>;

    /// Physically remove tombstones last modified before `cutoff_ms`
    fn purge_tombstones(&self, kind: EntityKind, cutoff_ms: i64) -> Result<usize>;
}

/// `SQLite` implementation of `EntityStore`
pub struct SqliteEntityStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteEntityStore<'a> {
    /// Create a new store with the given connection or transaction
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Issue the (stamp, timestamp) pair for a write about to happen
    fn stamp(&self) -> Result<(VersionStamp, i64)> {
        let stamp = VersionAuthority::new(self.conn).next()?;
        Ok((stamp, now_millis()))
    }

    fn require_live(&self, kind: EntityKind, id: &EntityId) -> Result<EntityRecord> {
        self.get(kind, id)?
            .filter(|record| !record.is_deleted)
            .ok_or_else(|| Error::NotFound(format!("{kind}/{id}")))
    }

    /// Parse an entity from a database row
    fn parse_entity(kind: EntityKind, row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
        let id: String = row.get(0)?;
        let data = match row.get::<_, Value>(2)? {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        Ok(EntityRecord {
            id: id.parse().map_err(|error: Error| {
                rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(error))
            })?,
            kind,
            owner_id: row.get(1)?,
            data,
            created_at: row.get(3)?,
            modified_at: row.get(4)?,
            version_stamp: VersionStamp::new(row.get(5)?),
            lock_version: LockVersion::new(row.get(6)?),
            is_deleted: row.get::<_, i32>(7)? != 0,
        })
    }
}

impl EntityStore for SqliteEntityStore<'_> {
    fn insert(
        &self,
        kind: EntityKind,
        id: &EntityId,
        owner_id: &str,
        fields: Map<String, Value>,
    ) -> Result<EntityRecord> {
        if self.get(kind, id)?.is_some() {
            return Err(Error::InvalidInput(format!("{kind}/{id} already exists")));
        }

        let (stamp, now) = self.stamp()?;
        self.conn.execute(
            &format!(
                "INSERT INTO {} (id, owner_id, data, created_at, modified_at, version_stamp, lock_version, is_deleted)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, 0)",
                kind.table()
            ),
            params![
                id.as_str(),
                owner_id,
                Value::Object(fields),
                now,
                stamp.get(),
                LockVersion::INITIAL.get()
            ],
        )?;

        tracing::debug!(entity = %kind, id = %id, stamp = stamp.get(), "Inserted entity");
        self.require_live(kind, id)
    }

    fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<EntityRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {ENTITY_COLUMNS} FROM {} WHERE id = ?", kind.table()),
                params![id.as_str()],
                |row| Self::parse_entity(kind, row),
            )
            .optional()?;
        Ok(record)
    }

    fn update(
        &self,
        kind: EntityKind,
        id: &EntityId,
        changes: Map<String, Value>,
    ) -> Result<EntityRecord> {
        let current = self.require_live(kind, id)?;
        let mut data = current.data;
        merge_fields(&mut data, changes);

        let (stamp, now) = self.stamp()?;
        let rows = self.conn.execute(
            &format!(
                "UPDATE {} SET data = ?1, modified_at = ?2, version_stamp = ?3, lock_version = lock_version + 1
                 WHERE id = ?4 AND is_deleted = 0",
                kind.table()
            ),
            params![Value::Object(data), now, stamp.get(), id.as_str()],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(format!("{kind}/{id}")));
        }

        tracing::debug!(entity = %kind, id = %id, stamp = stamp.get(), "Updated entity");
        self.require_live(kind, id)
    }

    fn compare_and_swap(
        &self,
        kind: EntityKind,
        id: &EntityId,
        expected: LockVersion,
        fields: Map<String, Value>,
    ) -> Result<Option<EntityRecord>> {
        let (stamp, now) = self.stamp()?;
        let rows = self.conn.execute(
            &format!(
                "UPDATE {} SET data = ?1, modified_at = ?2, version_stamp = ?3, lock_version = lock_version + 1
                 WHERE id = ?4 AND lock_version = ?5 AND is_deleted = 0",
                kind.table()
            ),
            params![
                Value::Object(fields),
                now,
                stamp.get(),
                id.as_str(),
                expected.get()
            ],
        )?;

        if rows == 0 {
            return Ok(None);
        }
        self.get(kind, id)
    }

    fn tombstone(&self, kind: EntityKind, id: &EntityId) -> Result<EntityRecord> {
        let (stamp, now) = self.stamp()?;
        let rows = self.conn.execute(
            &format!(
                "UPDATE {} SET is_deleted = 1, modified_at = ?1, version_stamp = ?2, lock_version = lock_version + 1
                 WHERE id = ?3 AND is_deleted = 0",
                kind.table()
            ),
            params![now, stamp.get(), id.as_str()],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(format!("{kind}/{id}")));
        }

        tracing::debug!(entity = %kind, id = %id, stamp = stamp.get(), "Tombstoned entity");
        self.get(kind, id)?
            .ok_or_else(|| Error::NotFound(format!("{kind}/{id}")))
    }

    fn changes_since(
        &self,
        kind: EntityKind,
        visibility: &Visibility,
        after: VersionStamp,
        upto: VersionStamp,
        limit: usize,
    ) -> Result<Vec<EntityRecord>> {
        let table = kind.table();
        let records = match visibility {
            Visibility::Nothing => Vec::new(),
            Visibility::Everyone => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {ENTITY_COLUMNS} FROM {table}
                     WHERE version_stamp > ?1 AND version_stamp <= ?2
                     ORDER BY version_stamp ASC
                     LIMIT ?3"
                ))?;
                let rows = stmt
                    .query_map(params![after.get(), upto.get(), limit as i64], |row| {
                        Self::parse_entity(kind, row)
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            Visibility::OwnedBy(owner_id) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {ENTITY_COLUMNS} FROM {table}
                     WHERE owner_id = ?1 AND version_stamp > ?2 AND version_stamp <= ?3
                     ORDER BY version_stamp ASC
                     LIMIT ?4"
                ))?;
                let rows = stmt
                    .query_map(
                        params![owner_id, after.get(), upto.get(), limit as i64],
                        |row| Self::parse_entity(kind, row),
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(records)
    }

    fn purge_tombstones(&self, kind: EntityKind, cutoff_ms: i64) -> Result<usize> {
        let purged = self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE is_deleted = 1 AND modified_at < ?1",
                kind.table()
            ),
            params![cutoff_ms],
        )?;
        Ok(purged)
    }
}
