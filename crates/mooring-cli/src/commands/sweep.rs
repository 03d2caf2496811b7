use mooring_core::SyncService;
use serde::Serialize;

use crate::commands::common::{days_or, format_cleanup_lines, print_json};
use crate::error::CliError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SweepSummary {
    abandoned_operations: usize,
    #[serde(flatten)]
    report: mooring_core::sync::CleanupReport,
}

/// Abandon stale operations, then run the retention sweep.
pub async fn run_sweep(
    service: &SyncService,
    retention_days: Option<u64>,
    abandon_after_days: Option<u64>,
    as_json: bool,
) -> Result<(), CliError> {
    let settings = service.settings();
    let retention = days_or(retention_days, "--retention-days", settings.retention)?;
    let abandon_after = days_or(
        abandon_after_days,
        "--abandon-after-days",
        settings.abandon_after,
    )?;

    let abandoned_operations = service.abandon_stale(abandon_after).await?;
    let report = service.cleanup(retention).await?;

    if as_json {
        return print_json(&SweepSummary {
            abandoned_operations,
            report,
        });
    }
    for line in format_cleanup_lines(abandoned_operations, &report) {
        println!("{line}");
    }
    Ok(())
}
