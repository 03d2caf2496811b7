use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use mooring_core::models::ConflictResolution;

#[derive(Parser)]
#[command(name = "mooring")]
#[command(about = "Apply, resolve, and sweep Mooring sync state")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the database file (defaults to MOORING_DATABASE_PATH, then ./mooring.db)
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply one pending operation
    Apply {
        /// Operation ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply pending operations, oldest first
    ApplyPending {
        /// Maximum number of operations to apply
        #[arg(short, long, default_value = "100")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Settle an operation that is in conflict
    Resolve {
        /// Operation ID
        id: String,
        /// Which side wins
        #[arg(long, value_enum)]
        strategy: Strategy,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Abandon stale operations and purge expired state
    Sweep {
        /// Retention window in days (defaults to MOORING_RETENTION_DAYS)
        #[arg(long)]
        retention_days: Option<u64>,
        /// Abandon operations unresolved for this many days (defaults to MOORING_ABANDON_AFTER_DAYS)
        #[arg(long)]
        abandon_after_days: Option<u64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show how far a client lags the store
    Status {
        /// Client ID
        client: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List a client's operations, newest first
    Operations {
        /// Client ID
        client: String,
        /// Number of operations to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    ServerWins,
    ClientWins,
}

impl From<Strategy> for ConflictResolution {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::ServerWins => Self::ServerWins,
            Strategy::ClientWins => Self::ClientWins,
        }
    }
}
