use mooring_core::models::ConflictResolution;
use mooring_core::sync::ApplyOutcome;
use mooring_core::{ErrorCode, SyncService};

use crate::commands::common::{format_outcome_line, parse_operation_id, print_json};
use crate::error::CliError;

pub async fn run_apply(service: &SyncService, id: &str, as_json: bool) -> Result<(), CliError> {
    let operation_id = parse_operation_id(id)?;
    let outcome = service.apply_operation(operation_id).await?;
    report(&outcome, as_json)?;
    into_result(outcome)
}

pub async fn run_resolve(
    service: &SyncService,
    id: &str,
    resolution: ConflictResolution,
    as_json: bool,
) -> Result<(), CliError> {
    let operation_id = parse_operation_id(id)?;
    let outcome = service.resolve_operation(operation_id, resolution).await?;
    report(&outcome, as_json)?;
    into_result(outcome)
}

/// Apply a batch. Individual failures are reported, not fatal.
pub async fn run_apply_pending(
    service: &SyncService,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let outcomes = service.apply_pending(limit).await?;

    if as_json {
        return print_json(&outcomes);
    }

    if outcomes.is_empty() {
        println!("No pending operations.");
        return Ok(());
    }
    for outcome in &outcomes {
        println!("{}", format_outcome_line(outcome));
    }
    let applied = outcomes.iter().filter(|outcome| outcome.success).count();
    println!("{applied}/{} applied", outcomes.len());
    Ok(())
}

fn report(outcome: &ApplyOutcome, as_json: bool) -> Result<(), CliError> {
    if as_json {
        print_json(outcome)
    } else {
        println!("{}", format_outcome_line(outcome));
        Ok(())
    }
}

fn into_result(outcome: ApplyOutcome) -> Result<(), CliError> {
    if outcome.success {
        return Ok(());
    }
    let (code, message) = outcome.error.map_or_else(
        || (ErrorCode::Internal, "no error reported".to_string()),
        |error| (error.code, error.message),
    );
    Err(CliError::OperationFailed {
        operation_id: outcome.operation_id.to_string(),
        code,
        message,
    })
}
