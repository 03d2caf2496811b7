//! Database migrations

use crate::error::Result;
use crate::models::EntityKind;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    Ok(version)
}

/// DDL shared by every syncable table
fn entity_table_ddl(kind: EntityKind) -> String {
    let table = kind.table();
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            data TEXT NOT NULL DEFAULT '{{}}',
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            version_stamp INTEGER NOT NULL,
            lock_version INTEGER NOT NULL DEFAULT 1,
            is_deleted INTEGER NOT NULL DEFAULT 0
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_{table}_version_stamp ON {table}(version_stamp);
        CREATE INDEX IF NOT EXISTS idx_{table}_owner_version ON {table}(owner_id, version_stamp);
        CREATE INDEX IF NOT EXISTS idx_{table}_deleted_modified ON {table}(is_deleted, modified_at);"
    )
}

/// Migration to version 1: version counter, syncable tables, checkpoints
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS version_counter (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            value INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO version_counter (id, value) VALUES (1, 0);
        CREATE TABLE IF NOT EXISTS sync_checkpoints (
            client_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            last_synced_version INTEGER NOT NULL,
            last_synced_at INTEGER NOT NULL,
            PRIMARY KEY (client_id, entity_type)
        );
        CREATE INDEX IF NOT EXISTS idx_sync_checkpoints_synced_at ON sync_checkpoints(last_synced_at);",
    )?;

    for kind in EntityKind::ALL {
        tx.execute_batch(&entity_table_ddl(kind))?;
    }

    tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    tx.commit()?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: pending operation queue
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS pending_operations (
            id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL,
            op_type TEXT NOT NULL CHECK (op_type IN ('create', 'update', 'delete')),
            entity_type TEXT NOT NULL,
            entity_id TEXT,
            payload TEXT NOT NULL,
            client_timestamp INTEGER NOT NULL,
            server_received_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            conflict_resolution TEXT,
            error_message TEXT,
            applied_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_pending_operations_status_received
            ON pending_operations(status, server_received_at);
        CREATE INDEX IF NOT EXISTS idx_pending_operations_client
            ON pending_operations(client_id, server_received_at DESC);
        INSERT INTO schema_version (version) VALUES (2);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 2");
    Ok(())
}

/// Migration to version 3: idempotency cache
fn migrate_v3(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS idempotency_keys (
            key TEXT NOT NULL,
            identity TEXT NOT NULL,
            operation_name TEXT NOT NULL,
            cached_response TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (key, identity)
        );
        CREATE INDEX IF NOT EXISTS idx_idempotency_keys_expires ON idempotency_keys(expires_at);
        INSERT INTO schema_version (version) VALUES (3);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
