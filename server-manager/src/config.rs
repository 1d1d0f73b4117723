//! Configuration management for the server manager.
//!
//! Loads configuration from a TOML file with `SERVER_MANAGER__SECTION__KEY`
//! environment variable overrides. The resolved configuration is immutable
//! for the lifetime of the process.

use crate::utils::errors::{ManagerError, Result};
use lettre::message::Mailbox;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "SERVER_MANAGER";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,

    #[serde(default)]
    pub restart: RestartConfig,

    pub rcon: RconConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backups: Option<BackupConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailing: Option<MailConfig>,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Display name used in notices and mail subjects
    pub name: String,

    /// Working directory of the game server
    pub folder: PathBuf,

    /// Executable to launch (resolved through PATH if not absolute)
    pub executable: String,

    /// Arguments passed to the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Restart the server after a crash
    #[serde(default = "default_true")]
    pub auto_restart: bool,

    /// Grace period between the termination signal and a forced kill
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Restarts tolerated inside one sliding window
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Sliding window length
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Delay before each restart
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RconConfig {
    #[serde(default = "default_rcon_host")]
    pub host: String,

    #[serde(default = "default_rcon_port")]
    pub port: u16,

    /// Shared secret, must match the server's rcon.password
    pub password: String,

    /// Bound on connect and on every command round-trip
    #[serde(default = "default_rcon_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Local backup root, relative to the working directory
    pub backup_folder: PathBuf,

    /// Directory to snapshot, relative to the server folder
    pub world_folder: PathBuf,

    pub incremental_freq_hours: u64,

    pub full_backup_every: u64,

    /// Full backups retained, each with its dependent incrementals
    pub keep_full_backup: u32,

    /// Remote destination; absent disables remote sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rclone_path: Option<String>,

    #[serde(default = "default_true")]
    pub flush_on_save: bool,

    /// Wait after `save-all` when not flushing, before the copy starts
    #[serde(default = "default_save_settle_secs")]
    pub save_settle_secs: u64,

    #[serde(default)]
    pub silent: bool,

    /// Scheduler resolution
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Minimum delay before retrying after a failed snapshot
    #[serde(default = "default_retry_after_minutes")]
    pub retry_after_minutes: u64,

    /// Remote sync attempts per successful backup
    #[serde(default = "default_sync_attempts")]
    pub sync_attempts: u32,

    #[serde(default = "default_rclone_binary")]
    pub rclone_binary: String,

    /// Run the sync tool under `nice`/`ionice`
    #[serde(default = "default_true")]
    pub sync_low_priority: bool,

    /// File names skipped while snapshotting
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    pub contacts: Vec<Contact>,

    pub smtp_server: String,

    /// Sender identity, e.g. `Server Manager <manager@example.org>`
    pub sender: String,

    pub username: String,

    pub password: String,

    /// Incidents arriving within this window share one mail
    #[serde(default = "default_batch_window_secs")]
    pub batch_window_secs: u64,

    /// Send a notice at startup (verifies the SMTP settings)
    #[serde(default = "default_true")]
    pub startup_mail: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (full, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default values
fn default_true() -> bool {
    true
}

fn default_stop_timeout_secs() -> u64 {
    60
}

fn default_max_restarts() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    15 * 60
}

fn default_backoff_secs() -> u64 {
    10
}

fn default_rcon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rcon_port() -> u16 {
    25575
}

fn default_rcon_timeout_secs() -> u64 {
    10
}

fn default_save_settle_secs() -> u64 {
    120
}

fn default_tick_interval_secs() -> u64 {
    5
}

fn default_retry_after_minutes() -> u64 {
    15
}

fn default_sync_attempts() -> u32 {
    5
}

fn default_rclone_binary() -> String {
    "rclone".to_string()
}

fn default_exclude() -> Vec<String> {
    vec!["session.lock".to_string()]
}

fn default_batch_window_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "full".to_string()
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            window_secs: default_window_secs(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RconConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl BackupConfig {
    pub fn incremental_interval(&self) -> chrono::Duration {
        chrono::Duration::hours(self.incremental_freq_hours as i64)
    }

    pub fn full_interval(&self) -> chrono::Duration {
        chrono::Duration::hours(self.full_backup_every as i64)
    }

    pub fn retry_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.retry_after_minutes as i64)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.backup_folder.join("catalog.db")
    }
}

impl MailConfig {
    pub fn sender_mailbox(&self) -> Result<Mailbox> {
        self.sender
            .parse()
            .map_err(|e| ManagerError::Config(format!("invalid mail sender `{}`: {}", self.sender, e)))
    }

    pub fn contact_mailboxes(&self) -> Result<Vec<Mailbox>> {
        self.contacts
            .iter()
            .map(|c| {
                let address = c.address.parse().map_err(|e| {
                    ManagerError::Config(format!("invalid contact address `{}`: {}", c.address, e))
                })?;
                Ok(Mailbox::new(c.name.clone(), address))
            })
            .collect()
    }
}

impl Config {
    /// Read a configuration file, applying environment overrides, without validating it
    pub fn from_file(path: &Path) -> Result<Self> {
        let loaded = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ManagerError::Config(e.to_string()))?;

        loaded
            .try_deserialize()
            .map_err(|e| ManagerError::Config(e.to_string()))
    }

    /// Read, validate and resolve a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_file(path)?.resolve()
    }

    /// Write this configuration as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ManagerError::Config(format!("failed to render configuration: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Starting point written when no configuration file exists
    pub fn template() -> Self {
        Config {
            server: ServerConfig {
                name: "Minecraft Server".to_string(),
                folder: PathBuf::from("./"),
                executable: "java".to_string(),
                args: vec![
                    "-jar".to_string(),
                    "minecraft_server.jar".to_string(),
                    "--nogui".to_string(),
                ],
                auto_restart: true,
                stop_timeout_secs: default_stop_timeout_secs(),
            },
            restart: RestartConfig::default(),
            rcon: RconConfig {
                host: default_rcon_host(),
                port: default_rcon_port(),
                password: uuid::Uuid::new_v4().simple().to_string(),
                timeout_secs: default_rcon_timeout_secs(),
            },
            backups: Some(BackupConfig {
                backup_folder: PathBuf::from("./backups"),
                world_folder: PathBuf::from("world"),
                incremental_freq_hours: 1,
                full_backup_every: 24 * 14,
                keep_full_backup: 2,
                rclone_path: None,
                flush_on_save: true,
                save_settle_secs: default_save_settle_secs(),
                silent: false,
                tick_interval_secs: default_tick_interval_secs(),
                retry_after_minutes: default_retry_after_minutes(),
                sync_attempts: default_sync_attempts(),
                rclone_binary: default_rclone_binary(),
                sync_low_priority: true,
                exclude: default_exclude(),
            }),
            mailing: None,
            log: LogConfig::default(),
        }
    }

    /// Validate settings and turn relative paths into absolute ones
    pub fn resolve(mut self) -> Result<Self> {
        let folder = std::fs::canonicalize(&self.server.folder).map_err(|_| {
            ManagerError::Config(format!(
                "failed to find server folder at {}",
                self.server.folder.display()
            ))
        })?;
        if !folder.is_dir() {
            return Err(ManagerError::Config(format!(
                "server folder {} is not a directory",
                folder.display()
            )));
        }
        self.server.folder = folder;

        if self.server.executable.trim().is_empty() {
            return Err(ManagerError::Config("server executable must not be empty".into()));
        }
        if self.restart.max_restarts == 0 || self.restart.window_secs == 0 {
            return Err(ManagerError::Config(
                "restart.max_restarts and restart.window_secs must be at least 1".into(),
            ));
        }
        if self.rcon.password.is_empty() {
            return Err(ManagerError::Config("rcon password must not be empty".into()));
        }
        if self.rcon.timeout_secs == 0 {
            return Err(ManagerError::Config("rcon timeout must be at least 1 second".into()));
        }

        if let Some(backups) = self.backups.as_mut() {
            std::fs::create_dir_all(&backups.backup_folder)?;
            backups.backup_folder = std::fs::canonicalize(&backups.backup_folder)?;
            backups.world_folder = self.server.folder.join(&backups.world_folder);

            if backups.incremental_freq_hours == 0 {
                return Err(ManagerError::Config(
                    "incremental backup frequency must not be zero".into(),
                ));
            }
            if backups.full_backup_every == 0 {
                return Err(ManagerError::Config("full_backup_every must not be zero".into()));
            }
            if backups.keep_full_backup == 0 {
                return Err(ManagerError::Config("keep_full_backup must be at least 1".into()));
            }
            if backups.tick_interval_secs == 0 || backups.sync_attempts == 0 {
                return Err(ManagerError::Config(
                    "tick_interval_secs and sync_attempts must be at least 1".into(),
                ));
            }
            if backups.world_folder.starts_with(&backups.backup_folder)
                || backups.backup_folder.starts_with(&backups.world_folder)
            {
                return Err(ManagerError::Config(
                    "backup folder and world folder must not contain each other".into(),
                ));
            }
        }

        if let Some(mailing) = &self.mailing {
            mailing.sender_mailbox()?;
            if mailing.contacts.is_empty() {
                return Err(ManagerError::Config("mailing.contacts must not be empty".into()));
            }
            mailing.contact_mailboxes()?;
        }

        Ok(self)
    }
}
