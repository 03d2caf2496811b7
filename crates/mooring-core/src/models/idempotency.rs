//! Idempotency record model

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cached response of an operation executed under an idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    /// Identity of the caller that first used the key
    pub identity: String,
    pub operation_name: String,
    pub cached_response: Value,
    /// Unix ms
    pub created_at: i64,
    /// Unix ms
    pub expires_at: i64,
}

impl IdempotencyRecord {
    pub const fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}
