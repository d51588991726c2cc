//! CLI command implementations.

mod config;
mod create;
mod enrich;
mod ingest;
mod init;
mod jobs;
mod list;
mod search;
mod serve;

pub use config::run_config;
pub use create::run_create;
pub use enrich::run_enrich;
pub use ingest::run_ingest;
pub use init::run_init;
pub use jobs::{run_cancel, run_jobs};
pub use list::run_list;
pub use search::run_search;
pub use serve::run_serve;

use crate::config::Settings;
use crate::store::SqliteStore;
use std::sync::Arc;

/// Open the configured store; shared by every command that touches data.
pub(crate) fn open_store(settings: &Settings) -> anyhow::Result<Arc<SqliteStore>> {
    Ok(Arc::new(SqliteStore::new(&settings.sqlite_path())?))
}
