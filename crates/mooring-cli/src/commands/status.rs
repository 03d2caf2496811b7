use mooring_core::util::now_millis;
use mooring_core::SyncService;

use crate::commands::common::{
    format_operation_lines, format_status_lines, normalize_client_id, print_json,
};
use crate::error::CliError;

pub async fn run_status(service: &SyncService, client: &str, as_json: bool) -> Result<(), CliError> {
    let client_id = normalize_client_id(client)?;
    let status = service.sync_status(&client_id).await?;

    if as_json {
        return print_json(&status);
    }
    for line in format_status_lines(&client_id, &status) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_operations(
    service: &SyncService,
    client: &str,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let client_id = normalize_client_id(client)?;
    let operations = service.list_operations(&client_id, limit).await?;

    if as_json {
        return print_json(&operations);
    }
    if operations.is_empty() {
        println!("No operations recorded for {client_id}.");
        return Ok(());
    }
    for line in format_operation_lines(&operations, now_millis()) {
        println!("{line}");
    }
    Ok(())
}
