use anyhow::Result;
use std::path::Path;

use forge_sync::config::{CliOverrides, SyncConfig};

/// Print the effective configuration as TOML, followed by any warnings.
pub fn cmd_config(config_path: Option<&Path>) -> Result<()> {
    let config = SyncConfig::resolve(config_path, &CliOverrides::default())?;
    print!("{}", config.to_toml()?);
    for warning in config.validate() {
        eprintln!("warning: {}", warning);
    }
    Ok(())
}
