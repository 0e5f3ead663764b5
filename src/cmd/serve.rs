use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use forge_sync::config::{CliOverrides, SyncConfig};
use forge_sync::engine::db::SyncDb;

pub async fn cmd_serve(config_path: Option<&Path>, cli: &CliOverrides, skip_catch_up: bool) -> Result<()> {
    let config = SyncConfig::resolve(config_path, cli)?;
    forge_sync::logging::init(&config.logging)?;
    tracing::info!(db = %config.database.path.display(), addr = %config.bind_addr(), "Starting forge-sync");
    forge_sync::engine::server::start_server(config, skip_catch_up).await
}

/// Create the database schema and exit.
pub fn cmd_init(db: Option<PathBuf>) -> Result<()> {
    let cli = CliOverrides { db, ..Default::default() };
    let config = SyncConfig::resolve(None, &cli)?;
    let db_path = &config.database.path;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    SyncDb::new(db_path)?;
    println!("Sync database initialized at {}", db_path.display());
    Ok(())
}
