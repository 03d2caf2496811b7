//! Idempotency cache.
//!
//! Deduplicates retried requests by a client-chosen key scoped to the
//! calling identity. The cache is advisory: any storage failure is logged
//! and treated as a miss, never surfaced to the caller.

use std::time::Duration;

use rusqlite::Connection;
use serde_json::Value;

use crate::db::{IdempotencyStore, SqliteIdempotencyStore};
use crate::error::Result;
use crate::models::IdempotencyRecord;
use crate::util::{duration_millis, fingerprint, now_millis};

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Live cached response
    Hit(Value),
    Miss,
}

impl CacheLookup {
    pub const fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyCache {
    ttl: Duration,
}

impl IdempotencyCache {
    pub const fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the live cached response for `(key, identity)`, or record
    /// `response` when one is supplied and nothing live exists.
    pub fn check_or_record(
        &self,
        conn: &Connection,
        key: &str,
        identity: &str,
        operation_name: &str,
        response: Option<&Value>,
    ) -> CacheLookup {
        match self.try_check_or_record(conn, key, identity, operation_name, response) {
            Ok(lookup) => lookup,
            Err(error) => {
                tracing::warn!(
                    client = fingerprint(identity),
                    operation = operation_name,
                    "Idempotency cache unavailable, treating as miss: {error}"
                );
                CacheLookup::Miss
            }
        }
    }

    fn try_check_or_record(
        &self,
        conn: &Connection,
        key: &str,
        identity: &str,
        operation_name: &str,
        response: Option<&Value>,
    ) -> Result<CacheLookup> {
        let store = SqliteIdempotencyStore::new(conn);
        let now = now_millis();

        if let Some(record) = store.get(key, identity)? {
            if !record.is_expired(now) {
                if record.operation_name != operation_name {
                    tracing::warn!(
                        client = fingerprint(identity),
                        cached = %record.operation_name,
                        requested = operation_name,
                        "Idempotency key reused for a different operation"
                    );
                }
                return Ok(CacheLookup::Hit(record.cached_response));
            }
        }

        if let Some(response) = response {
            store.put(&IdempotencyRecord {
                key: key.to_string(),
                identity: identity.to_string(),
                operation_name: operation_name.to_string(),
                cached_response: response.clone(),
                created_at: now,
                expires_at: now.saturating_add(duration_millis(self.ttl)),
            })?;
        }
        Ok(CacheLookup::Miss)
    }

    /// Purge expired records and any record older than `retention`
    pub fn cleanup(&self, conn: &Connection, retention: Duration) -> usize {
        let now = now_millis();
        let cutoff = now.saturating_sub(duration_millis(retention));
        match SqliteIdempotencyStore::new(conn).purge(now, cutoff) {
            Ok(purged) => purged,
            Err(error) => {
                tracing::warn!("Idempotency cleanup failed: {error}");
                0
            }
        }
    }
}
