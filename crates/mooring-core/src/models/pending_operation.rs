//! Pending operation model and its state machine

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{EntityId, EntityKind};
use crate::error::Error;

/// Identifier of a submitted operation, UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| Error::InvalidInput(format!("invalid operation id: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Whether the operation targets an existing row and so can go stale
    pub const fn targets_existing(self) -> bool {
        matches!(self, Self::Update | Self::Delete)
    }
}

impl FromStr for OperationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown op_type: {other}"))),
        }
    }
}

/// Lifecycle of a pending operation.
///
/// `pending -> applied | conflict | rejected | abandoned`,
/// `conflict -> resolved | abandoned`. Everything else is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Applied,
    Conflict,
    Rejected,
    Resolved,
    Abandoned,
}

impl OperationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Conflict => "conflict",
            Self::Rejected => "rejected",
            Self::Resolved => "resolved",
            Self::Abandoned => "abandoned",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Applied | Self::Rejected | Self::Resolved | Self::Abandoned
        )
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Pending,
                Self::Applied | Self::Conflict | Self::Rejected | Self::Abandoned
            ) | (Self::Conflict, Self::Resolved | Self::Abandoned)
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "conflict" => Ok(Self::Conflict),
            "rejected" => Ok(Self::Rejected),
            "resolved" => Ok(Self::Resolved),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(Error::Database(format!("unknown operation status: {other}"))),
        }
    }
}

/// Outcome chosen for an operation stuck in `conflict`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Keep the server row, discard the client payload
    ServerWins,
    /// Apply the client payload over the server row
    ClientWins,
}

impl ConflictResolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServerWins => "server_wins",
            Self::ClientWins => "client_wins",
        }
    }
}

impl FromStr for ConflictResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server_wins" => Ok(Self::ServerWins),
            "client_wins" => Ok(Self::ClientWins),
            other => Err(Error::InvalidInput(format!(
                "unknown conflict resolution: {other}"
            ))),
        }
    }
}

/// A client mutation as submitted, before it is persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperation {
    pub client_id: String,
    pub op_type: OperationType,
    pub entity_kind: EntityKind,
    pub entity_id: Option<EntityId>,
    pub payload: Value,
    /// Client's view of the entity's last modification (Unix ms)
    pub client_timestamp: i64,
}

/// A persisted client mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: OperationId,
    pub client_id: String,
    pub op_type: OperationType,
    pub entity_kind: EntityKind,
    pub entity_id: Option<EntityId>,
    pub payload: Value,
    pub client_timestamp: i64,
    pub server_received_at: i64,
    pub status: OperationStatus,
    pub conflict_resolution: Option<ConflictResolution>,
    pub error_message: Option<String>,
    pub applied_at: Option<i64>,
}
