use std::time::Duration;

use mooring_core::models::PendingOperation;
use mooring_core::sync::{ApplyOutcome, CleanupReport, SyncStatus};
use mooring_core::OperationId;
use serde::Serialize;

use crate::error::CliError;

pub const SECS_PER_DAY: u64 = 86_400;

pub fn parse_operation_id(id: &str) -> Result<OperationId, CliError> {
    Ok(id.parse::<OperationId>()?)
}

pub fn normalize_client_id(client: &str) -> Result<String, CliError> {
    let trimmed = client.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyClientId);
    }
    Ok(trimmed.to_string())
}

/// A day-count flag as a duration, or `default` when the flag was omitted
pub fn days_or(
    value: Option<u64>,
    flag: &'static str,
    default: Duration,
) -> Result<Duration, CliError> {
    match value {
        None => Ok(default),
        Some(0) => Err(CliError::ZeroDays(flag)),
        Some(days) => Ok(Duration::from_secs(days.saturating_mul(SECS_PER_DAY))),
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn format_outcome_line(outcome: &ApplyOutcome) -> String {
    let status = outcome.status.map_or("missing", |status| status.as_str());
    if let Some(error) = &outcome.error {
        return format!(
            "{}  {:<9}  {}: {}",
            outcome.operation_id, status, error.code, error.message
        );
    }
    match &outcome.entity {
        Some(entity) => format!(
            "{}  {:<9}  {}/{}  stamp={}  lock={}",
            outcome.operation_id,
            status,
            entity.kind,
            entity.id,
            entity.version_stamp,
            entity.lock_version
        ),
        None => format!("{}  {status}", outcome.operation_id),
    }
}

pub fn format_status_lines(client_id: &str, status: &SyncStatus) -> Vec<String> {
    let mut lines = vec![
        format!("client {client_id}"),
        format!("current version  {}", status.current_version),
        format!("open operations  {}", status.pending_operations),
    ];
    if status.checkpoints.is_empty() {
        lines.push("never synced".to_string());
        return lines;
    }
    for (kind, checkpoint) in &status.checkpoints {
        lines.push(format!(
            "{:<14} last={:<8} behind={:<8} synced {}",
            kind.as_str(),
            checkpoint.last_version,
            checkpoint.behind_by,
            format_timestamp(checkpoint.last_sync_at)
        ));
    }
    lines
}

pub fn format_operation_lines(operations: &[PendingOperation], now_ms: i64) -> Vec<String> {
    operations
        .iter()
        .map(|operation| {
            let target = operation
                .entity_id
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string);
            let mut line = format!(
                "{}  {:<9}  {:<6} {}/{}  {}",
                operation.id,
                operation.status.as_str(),
                operation.op_type.as_str(),
                operation.entity_kind,
                target,
                format_relative_time(operation.server_received_at, now_ms)
            );
            if let Some(message) = &operation.error_message {
                line.push_str("  ");
                line.push_str(message);
            }
            line
        })
        .collect()
}

pub fn format_cleanup_lines(abandoned: usize, report: &CleanupReport) -> Vec<String> {
    vec![
        format!("abandoned operations  {abandoned}"),
        format!("idempotency records   {}", report.idempotency_records),
        format!("terminal operations   {}", report.operations),
        format!("idle checkpoints      {}", report.checkpoints),
        format!("tombstones            {}", report.tombstones),
    ]
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
