//! Server Manager - Main entry point
//!
//! Supervises a game server process with automatic restarts, scheduled
//! backups and incident mail.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use server_manager::backup::catalog;
use server_manager::backup::snapshot::DirectorySnapshotStore;
use server_manager::config::Config;
use server_manager::daemon::{runtime, shutdown};
use server_manager::db::{create_pool, migrate::migrate};
use server_manager::supervisor::SupervisorExit;
use server_manager::utils;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "server-manager.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise the server (default)
    Run,
    /// List retained backups
    List,
    /// Rebuild a retained backup into an empty directory
    Restore {
        /// Backup id as shown by `list`
        id: String,
        /// Directory to restore into
        target: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if !args.config.exists() {
        Config::template().save(&args.config)?;
        println!(
            "No configuration found. A default one was written to {}; edit it and start again.",
            args.config.display()
        );
        return Ok(());
    }

    let config = Config::load(&args.config)
        .with_context(|| format!("invalid configuration in {}", args.config.display()))?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, &config.log.format)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::List => list(&config),
        Command::Restore { id, target } => restore(&config, &id, &target),
    }
}

async fn run(config: Config) -> Result<()> {
    tracing::info!(
        "Starting server-manager v{} for {}",
        env!("CARGO_PKG_VERSION"),
        config.server.name
    );

    let signal = async {
        if let Err(e) = shutdown::wait_for_signal().await {
            tracing::error!("Failed to listen for shutdown signals: {}", e);
            std::future::pending::<()>().await;
        }
    };

    match runtime::run(Arc::new(config), signal).await? {
        SupervisorExit::Halted => anyhow::bail!("automatic recovery halted; operator action required"),
        SupervisorExit::Stopped | SupervisorExit::ServerExited => Ok(()),
    }
}

fn open_catalog(config: &Config) -> Result<(server_manager::db::DbPool, DirectorySnapshotStore)> {
    let backups = config
        .backups
        .as_ref()
        .context("no [backups] section in the configuration")?;
    let db = create_pool(&backups.catalog_path())?;
    migrate(&db)?;
    let store = DirectorySnapshotStore::new(&backups.backup_folder, backups.exclude.clone());
    Ok((db, store))
}

fn list(config: &Config) -> Result<()> {
    let (db, _) = open_catalog(config)?;
    let records = catalog::find_all(&*db.get()?)?;

    if records.is_empty() {
        println!("No backups retained.");
        return Ok(());
    }

    println!("{:<34} {:<12} {:<24} {:>12}", "ID", "KIND", "COMPLETED", "SIZE");
    for record in records {
        println!(
            "{:<34} {:<12} {:<24} {:>12}",
            record.id,
            record.kind.as_str(),
            record.completed_at.format("%Y-%m-%d %H:%M:%S UTC"),
            utils::format::format_bytes(record.bytes_total)
        );
        if let Some(parent) = record.parent_id {
            println!("    based on {}", parent);
        }
    }
    Ok(())
}

fn restore(config: &Config, id: &str, target: &Path) -> Result<()> {
    let (db, store) = open_catalog(config)?;
    catalog::find_by_id(&*db.get()?, id)?
        .with_context(|| format!("backup {} is not in the catalog", id))?;

    let restored = store.restore(id, target)?;
    println!("Restored {} file(s) from {} into {}", restored, id, target.display());
    Ok(())
}
