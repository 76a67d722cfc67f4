//! ch-backup - Main entry point
//!
//! Thin command-line wrapper around the backup library.

use anyhow::Result;
use ch_backup::{
    clickhouse::ClickhouseControl,
    config::Config,
    storage::{create_engine, BackupLayout},
    utils, BackupOptions, ClickhouseBackup, RestoreOptions,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new backup
    Backup {
        /// Backup name (defaults to the current UTC time)
        #[arg(long)]
        name: Option<String>,

        /// Comma-separated list of databases
        #[arg(short, long, value_delimiter = ',')]
        databases: Option<Vec<String>>,

        /// Ignore the minimum backup interval
        #[arg(short, long)]
        force: bool,

        /// Leave out parts that fail to upload instead of failing
        #[arg(long)]
        keep_going: bool,
    },

    /// Restore a backup
    Restore {
        name: String,

        /// Comma-separated list of databases
        #[arg(short, long, value_delimiter = ',')]
        databases: Option<Vec<String>>,

        /// Skip parts that fail to download instead of failing
        #[arg(long)]
        keep_going: bool,
    },

    /// List complete backups, newest first
    List,

    /// Print a backup's metadata document
    Show { name: String },

    /// Delete a backup
    Delete { name: String },

    /// Delete backups outside the retention policy
    Purge,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    if let Command::Config = args.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing::debug!("Starting ch-backup v{}", env!("CARGO_PKG_VERSION"));

    let engine = create_engine(&config.storage)?;
    let layout = BackupLayout::new(engine, &config.backup.path_root, config.storage.tarball_parts);
    let ch_ctl = Arc::new(ClickhouseControl::new(&config.clickhouse)?);
    let app = ClickhouseBackup::new(config, ch_ctl, layout).await;

    match args.command {
        Command::Backup {
            name,
            databases,
            force,
            keep_going,
        } => {
            let name = app
                .backup(BackupOptions {
                    name,
                    databases,
                    force,
                    keep_going,
                })
                .await?;
            println!("{}", name);
        }
        Command::Restore {
            name,
            databases,
            keep_going,
        } => {
            app.restore(
                &name,
                RestoreOptions {
                    databases,
                    keep_going,
                },
            )
            .await?;
        }
        Command::List => {
            for name in app.list().await? {
                println!("{}", name);
            }
        }
        Command::Show { name } => {
            let meta = app.show(&name).await?;
            println!("{}", meta.to_json()?);
        }
        Command::Delete { name } => {
            app.delete(&name).await?;
        }
        Command::Purge => {
            for name in app.purge().await? {
                println!("{}", name);
            }
        }
        Command::Config => {}
    }

    app.shutdown().await;
    Ok(())
}
