//! Mooring CLI - the trusted applier and scheduled sweeper
//!
//! Runs against the same database as `mooring-api`.

mod cli;
mod commands;
mod error;


use std::env;
use std::path::PathBuf;

use clap::Parser;
use mooring_core::{SyncService, SyncSettings};

use crate::cli::{Cli, Commands};
use crate::commands::apply::{run_apply, run_apply_pending, run_resolve};
use crate::commands::status::{run_operations, run_status};
use crate::commands::sweep::run_sweep;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["mooring=info", "mooring_core=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = SyncSettings::from_env()?;
    let service = SyncService::open_path(resolve_db_path(cli.db_path), settings).await?;

    match cli.command {
        Commands::Apply { id, json } => run_apply(&service, &id, json).await?,
        Commands::ApplyPending { limit, json } => run_apply_pending(&service, limit, json).await?,
        Commands::Resolve { id, strategy, json } => {
            run_resolve(&service, &id, strategy.into(), json).await?;
        }
        Commands::Sweep {
            retention_days,
            abandon_after_days,
            json,
        } => run_sweep(&service, retention_days, abandon_after_days, json).await?,
        Commands::Status { client, json } => run_status(&service, &client, json).await?,
        Commands::Operations {
            client,
            limit,
            json,
        } => run_operations(&service, &client, limit, json).await?,
    }

    Ok(())
}

fn resolve_db_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| env::var_os("MOORING_DATABASE_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("mooring.db"))
}
