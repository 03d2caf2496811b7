//! Services shared by the API server and the admin CLI

mod sync_service;

pub use sync_service::{Replayable, SyncService};
