//! Sync checkpoint model

use serde::{Deserialize, Serialize};

use super::{EntityKind, VersionStamp};

/// Last version stamp a client has fully observed for one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    pub client_id: String,
    pub entity_kind: EntityKind,
    pub last_synced_version: VersionStamp,
    /// Unix ms of the delta call that wrote this checkpoint
    pub last_synced_at: i64,
}
