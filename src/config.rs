//! Layered configuration for forge-sync.
//!
//! Values come from a TOML file, then environment variables, then CLI flags,
//! each layer overriding the previous one. Every section has defaults, so an
//! empty file (or no file) is a valid configuration.
//!
//! ```toml
//! [http]
//! host = "127.0.0.1"
//! port = 8119
//!
//! [database]
//! path = ".forge-sync/sync.db"
//!
//! [address]
//! public_url = "https://sync.example.com"
//!
//! [export]
//! base_delay_secs = 30
//! max_delay_secs = 600
//! max_attempts = 10
//! sweep_interval_secs = 10
//! recovery_window_days = 3
//! recovery_delay_secs = 1
//!
//! [import]
//! user_rescan_interval_secs = 900
//! initial_window_days = 30
//!
//! [change_feed]
//! debounce_ms = 100
//! poll_interval_ms = 1000
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! dir = ".forge-sync/logs"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_PORT: &str = "FORGE_SYNC_PORT";
pub const ENV_DB: &str = "FORGE_SYNC_DB";
pub const ENV_PUBLIC_URL: &str = "FORGE_SYNC_PUBLIC_URL";
pub const ENV_LOG_FORMAT: &str = "FORGE_SYNC_LOG_FORMAT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8119,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".forge-sync/sync.db"),
        }
    }
}

/// Fallback callback address, used when the system row carries none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AddressConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
    pub sweep_interval_secs: u64,
    /// Tasks created within this many days are recovered on startup.
    pub recovery_window_days: i64,
    pub recovery_delay_secs: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 30,
            max_delay_secs: 600,
            max_attempts: 10,
            sweep_interval_secs: 10,
            recovery_window_days: 3,
            recovery_delay_secs: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImportConfig {
    pub user_rescan_interval_secs: u64,
    /// How far back the first scan of a new repo/project pairing reaches.
    pub initial_window_days: i64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            user_rescan_interval_secs: 900,
            initial_window_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChangeFeedConfig {
    pub debounce_ms: u64,
    /// How often to look for rows written by other database connections.
    /// `0` turns the check off; only writes made through this process are
    /// then seen.
    pub poll_interval_ms: u64,
}

impl Default for ChangeFeedConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    /// Directory for a daily rolling log file, in addition to stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub address: AddressConfig,
    pub export: ExportConfig,
    pub import: ImportConfig,
    pub change_feed: ChangeFeedConfig,
    pub logging: LoggingConfig,
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub db: Option<PathBuf>,
    pub public_url: Option<String>,
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse forge-sync config")
    }

    /// Load `path` if given, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Resolve the full layering: file, process environment, CLI flags.
    pub fn resolve(path: Option<&Path>, cli: &CliOverrides) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.apply_cli(cli);
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_PORT) {
            self.http.port = port
                .trim()
                .parse()
                .with_context(|| format!("{} must be a port number, got '{}'", ENV_PORT, port))?;
        }
        if let Some(db) = lookup(ENV_DB) {
            self.database.path = PathBuf::from(db);
        }
        if let Some(url) = lookup(ENV_PUBLIC_URL).filter(|url| !url.trim().is_empty()) {
            self.address.public_url = Some(url);
        }
        if let Some(format) = lookup(ENV_LOG_FORMAT) {
            self.logging.format = format.parse().with_context(|| format!("Invalid {}", ENV_LOG_FORMAT))?;
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(port) = cli.port {
            self.http.port = port;
        }
        if let Some(db) = &cli.db {
            self.database.path = db.clone();
        }
        if let Some(url) = &cli.public_url {
            self.address.public_url = Some(url.clone());
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize forge-sync config")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.http.host, self.http.port)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.export.base_delay_secs > self.export.max_delay_secs {
            warnings.push(format!(
                "export.base_delay_secs ({}) exceeds export.max_delay_secs ({})",
                self.export.base_delay_secs, self.export.max_delay_secs
            ));
        }
        if self.export.max_attempts == 0 {
            warnings.push("export.max_attempts is 0: failed exports are never retried".to_string());
        }
        if self.address.public_url.is_none() {
            warnings.push(
                "address.public_url is unset: webhooks are only installed once the system address is set"
                    .to_string(),
            );
        }
        warnings
    }
}
