// ABOUTME: Library root for table-replicator
// ABOUTME: Single-table retroactive / incremental replication between PostgreSQL, MySQL and SQLite

pub mod backend;
pub mod config;
pub mod error;
pub mod status;
pub mod sync;
pub mod table;
pub mod utils;

pub use config::{ProfileConfig, ReplicatorConfig};
pub use error::{Side, SyncError, SyncResult};
pub use status::{RunOutcome, RunStatus, StatusStore};
pub use sync::{run_profile, run_with, RunContext, RunReport, SyncMode};
