use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use forge_sync::config::CliOverrides;

mod cmd;

#[derive(Parser)]
#[command(name = "forge-sync")]
#[command(version, about = "Synchronize a GitLab forge with local projects")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sync engine and webhook receiver
    Serve {
        /// Path to a forge-sync TOML config file
        #[arg(short, long, env = "FORGE_SYNC_CONFIG")]
        config: Option<PathBuf>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Path to the SQLite database
        #[arg(long)]
        db: Option<PathBuf>,

        /// Externally visible base URL the forge calls back to
        #[arg(long)]
        public_url: Option<String>,

        /// Start serving without the startup import and hook installation
        #[arg(long)]
        skip_catch_up: bool,
    },
    /// Create the database schema and exit
    Init {
        /// Path to the SQLite database
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config {
        /// Path to a forge-sync TOML config file
        #[arg(short, long, env = "FORGE_SYNC_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            db,
            public_url,
            skip_catch_up,
        } => {
            let overrides = CliOverrides { port, db, public_url };
            cmd::cmd_serve(config.as_deref(), &overrides, skip_catch_up).await?;
        }
        Commands::Init { db } => {
            cmd::cmd_init(db)?;
        }
        Commands::Config { config } => {
            cmd::cmd_config(config.as_deref())?;
        }
    }

    Ok(())
}
