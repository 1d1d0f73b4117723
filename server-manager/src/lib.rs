//! Server Manager Library
//!
//! Keeps a game server running, backs up its world on a full/incremental
//! schedule with bounded retention, mirrors backups to a remote and mails
//! incidents to operators.

pub mod backup;
pub mod config;
pub mod daemon;
pub mod db;
pub mod fs;
pub mod incident;
pub mod rcon;
pub mod remote;
pub mod supervisor;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{ManagerError, Result};
