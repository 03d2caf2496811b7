//! Pending operation queue and conflict detector.
//!
//! Clients push mutations through [`submit`]; a trusted applier later moves
//! each one to a terminal state with [`apply`] or, for conflicts,
//! [`resolve`]. Every outcome a caller can act on is a structured result;
//! only infrastructure faults surface as `Err`.

use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::{EntityStore, OperationStore, SqliteEntityStore, SqliteOperationStore, Transition};
use crate::error::{Error, ErrorCode, Result};
use crate::models::{
    sanitize_fields, ConflictResolution, EntityId, EntityRecord, NewOperation, OperationId,
    OperationStatus, OperationType, PendingOperation,
};
use crate::sync::VisibilityPolicy;
use crate::util::{fingerprint, normalize_text_option, now_millis};

/// Informed after an operation's mutation commits. Must not block.
pub trait OperationObserver: Send + Sync {
    fn operation_applied(&self, operation_id: &OperationId, entity: &EntityRecord);
}

/// Timestamps that made a submitted operation stale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub code: ErrorCode,
    pub server_timestamp: i64,
    pub client_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    /// `false` when the operation was stored in conflict
    pub accepted: bool,
    pub operation_id: OperationId,
    pub status: OperationStatus,
    /// Target row; generated by the server for creates without an id
    pub entity_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub code: ErrorCode,
    pub message: String,
}

/// Result of an apply or resolve step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub success: bool,
    pub operation_id: OperationId,
    /// Status after the step; absent when the operation does not exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OperationStatus>,
    /// Row as written by the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
}

impl ApplyOutcome {
    fn succeeded(
        operation_id: OperationId,
        status: OperationStatus,
        entity: Option<EntityRecord>,
    ) -> Self {
        Self {
            success: true,
            operation_id,
            status: Some(status),
            entity,
            error: None,
        }
    }

    fn failed(
        operation_id: OperationId,
        status: Option<OperationStatus>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            operation_id,
            status,
            entity: None,
            error: Some(OutcomeError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Outcome for an operation that is not waiting on the step
    fn not_actionable(operation: &PendingOperation) -> Self {
        let (code, message) = match operation.status {
            OperationStatus::Conflict => (
                ErrorCode::ConflictUnresolved,
                "operation is in conflict and must be resolved first".to_string(),
            ),
            status => (
                ErrorCode::AlreadyProcessed,
                format!("operation already {status}"),
            ),
        };
        Self::failed(operation.id, Some(operation.status), code, message)
    }

    fn missing(operation_id: OperationId) -> Self {
        Self::failed(
            operation_id,
            None,
            ErrorCode::NotFound,
            format!("operation {operation_id} not found"),
        )
    }

    /// Entity written by a successful step
    pub fn applied_entity(&self) -> Option<&EntityRecord> {
        self.entity.as_ref().filter(|_| self.success)
    }
}

/// Validate and persist a client mutation, flagging stale updates and deletes.
///
/// Updates and deletes are refused with `Forbidden` when `policy` does not let
/// the client modify the target row.
pub fn submit(
    conn: &mut Connection,
    policy: &dyn VisibilityPolicy,
    operation: NewOperation,
) -> Result<SubmitOutcome> {
    let client_id = normalize_text_option(Some(operation.client_id))
        .ok_or_else(|| Error::InvalidInput("client id must not be empty".into()))?;

    let entity_id = match (operation.op_type, operation.entity_id) {
        (_, Some(id)) => id,
        (OperationType::Create, None) => EntityId::generate(),
        (op_type, None) => {
            return Err(Error::InvalidInput(format!(
                "{} operations require an entity id",
                op_type.as_str()
            )))
        }
    };

    // Deletes carry no fields
    let payload = match operation.op_type {
        OperationType::Create | OperationType::Update => {
            Value::Object(sanitize_fields(&operation.payload)?)
        }
        OperationType::Delete => Value::Object(Map::new()),
    };

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = now_millis();

    let current = if operation.op_type.targets_existing() {
        SqliteEntityStore::new(&tx).get(operation.entity_kind, &entity_id)?
    } else {
        None
    };
    if let Some(record) = &current {
        if !policy.may_modify(&client_id, record) {
            return Err(Error::Forbidden(format!(
                "{} {} belongs to another client",
                operation.entity_kind, entity_id
            )));
        }
    }
    let conflict = current
        .filter(|record| record.modified_at > operation.client_timestamp)
        .map(|record| ConflictInfo {
            code: ErrorCode::OperationConflict,
            server_timestamp: record.modified_at,
            client_timestamp: operation.client_timestamp,
        });
    let status = if conflict.is_some() {
        OperationStatus::Conflict
    } else {
        OperationStatus::Pending
    };

    let pending = PendingOperation {
        id: OperationId::new(),
        client_id,
        op_type: operation.op_type,
        entity_kind: operation.entity_kind,
        entity_id: Some(entity_id.clone()),
        payload,
        client_timestamp: operation.client_timestamp,
        server_received_at: now,
        status,
        conflict_resolution: None,
        error_message: None,
        applied_at: None,
    };
    SqliteOperationStore::new(&tx).insert(&pending)?;
    tx.commit()?;

    if let Some(info) = &conflict {
        tracing::info!(
            operation_id = %pending.id,
            client = fingerprint(&pending.client_id),
            entity = %pending.entity_kind,
            server_timestamp = info.server_timestamp,
            client_timestamp = info.client_timestamp,
            "Stored stale operation as conflict"
        );
    } else {
        tracing::debug!(
            operation_id = %pending.id,
            op_type = pending.op_type.as_str(),
            entity = %pending.entity_kind,
            "Queued operation"
        );
    }

    Ok(SubmitOutcome {
        accepted: conflict.is_none(),
        operation_id: pending.id,
        status,
        entity_id,
        conflict,
    })
}

/// Execute a pending operation's mutation.
///
/// Mutation failures roll back to a savepoint and are recorded on the
/// operation as `rejected`; they are reported in the outcome, not as `Err`.
pub fn apply(conn: &mut Connection, operation_id: &OperationId) -> Result<ApplyOutcome> {
    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let Some(operation) = SqliteOperationStore::new(&tx).get(operation_id)? else {
        return Ok(ApplyOutcome::missing(*operation_id));
    };
    if operation.status != OperationStatus::Pending {
        return Ok(ApplyOutcome::not_actionable(&operation));
    }

    let result = {
        let savepoint = tx.savepoint()?;
        match execute(&savepoint, &operation) {
            Ok(record) => {
                savepoint.commit()?;
                Ok(record)
            }
            Err(error) => {
                // Default drop behavior rolls the savepoint back
                savepoint.finish()?;
                Err(error)
            }
        }
    };

    let store = SqliteOperationStore::new(&tx);
    let outcome = match result {
        Ok(record) => {
            let mut transition =
                Transition::new(OperationStatus::Pending, OperationStatus::Applied);
            transition.applied_at = Some(now_millis());
            store.transition(operation_id, &transition)?;
            ApplyOutcome::succeeded(*operation_id, OperationStatus::Applied, Some(record))
        }
        Err(error) => {
            let message = error.to_string();
            let mut transition =
                Transition::new(OperationStatus::Pending, OperationStatus::Rejected);
            transition.error_message = Some(&message);
            store.transition(operation_id, &transition)?;
            tracing::warn!(
                operation_id = %operation_id,
                code = %error.code(),
                "Rejected operation: {message}"
            );
            ApplyOutcome::failed(
                *operation_id,
                Some(OperationStatus::Rejected),
                error.code(),
                message,
            )
        }
    };
    tx.commit()?;

    if outcome.success {
        tracing::info!(operation_id = %operation_id, "Applied operation");
    }
    Ok(outcome)
}

/// Settle an operation stuck in `conflict`.
///
/// `ClientWins` applies the stored payload over the current row; if that
/// fails the operation stays in conflict so another strategy can be chosen.
pub fn resolve(
    conn: &mut Connection,
    operation_id: &OperationId,
    resolution: ConflictResolution,
) -> Result<ApplyOutcome> {
    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let Some(operation) = SqliteOperationStore::new(&tx).get(operation_id)? else {
        return Ok(ApplyOutcome::missing(*operation_id));
    };
    match operation.status {
        OperationStatus::Conflict => {}
        OperationStatus::Pending => {
            return Ok(ApplyOutcome::failed(
                *operation_id,
                Some(OperationStatus::Pending),
                ErrorCode::InvalidInput,
                "operation is not in conflict; apply it instead",
            ))
        }
        _ => return Ok(ApplyOutcome::not_actionable(&operation)),
    }

    let entity = match resolution {
        ConflictResolution::ServerWins => None,
        ConflictResolution::ClientWins => {
            let savepoint = tx.savepoint()?;
            match execute(&savepoint, &operation) {
                Ok(record) => {
                    savepoint.commit()?;
                    Some(record)
                }
                Err(error) => {
                    savepoint.finish()?;
                    tracing::warn!(
                        operation_id = %operation_id,
                        code = %error.code(),
                        "Client-wins resolution failed: {error}"
                    );
                    return Ok(ApplyOutcome::failed(
                        *operation_id,
                        Some(OperationStatus::Conflict),
                        error.code(),
                        error.to_string(),
                    ));
                }
            }
        }
    };

    let mut transition = Transition::new(OperationStatus::Conflict, OperationStatus::Resolved);
    transition.resolution = Some(resolution);
    if resolution == ConflictResolution::ClientWins {
        transition.applied_at = Some(now_millis());
    }
    SqliteOperationStore::new(&tx).transition(operation_id, &transition)?;
    tx.commit()?;

    tracing::info!(
        operation_id = %operation_id,
        resolution = resolution.as_str(),
        "Resolved conflicting operation"
    );
    Ok(ApplyOutcome::succeeded(
        *operation_id,
        OperationStatus::Resolved,
        entity,
    ))
}

/// Apply up to `limit` pending operations, oldest first
pub fn apply_pending(conn: &mut Connection, limit: usize) -> Result<Vec<ApplyOutcome>> {
    let ids: Vec<OperationId> = SqliteOperationStore::new(conn)
        .list_by_status(OperationStatus::Pending, limit)?
        .into_iter()
        .map(|operation| operation.id)
        .collect();

    let mut outcomes = Vec::with_capacity(ids.len());
    for id in &ids {
        outcomes.push(apply(conn, id)?);
    }
    Ok(outcomes)
}

/// Abandon pending and conflicting operations received before `cutoff_ms`
pub fn abandon_stale(conn: &mut Connection, cutoff_ms: i64) -> Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let abandoned = SqliteOperationStore::new(&tx).abandon_older_than(cutoff_ms)?;
    tx.commit()?;

    if abandoned > 0 {
        tracing::info!(abandoned, "Abandoned stale operations");
    }
    Ok(abandoned)
}

/// Run an operation's mutation against the entity store
fn execute(conn: &Connection, operation: &PendingOperation) -> Result<EntityRecord> {
    let store = SqliteEntityStore::new(conn);
    let kind = operation.entity_kind;
    let id = operation
        .entity_id
        .as_ref()
        .ok_or_else(|| Error::InvalidInput("operation has no entity id".into()))?;

    match operation.op_type {
        OperationType::Create => store.insert(
            kind,
            id,
            &operation.client_id,
            sanitize_fields(&operation.payload)?,
        ),
        OperationType::Update => store.update(kind, id, sanitize_fields(&operation.payload)?),
        OperationType::Delete => store.tombstone(kind, id),
    }
}
