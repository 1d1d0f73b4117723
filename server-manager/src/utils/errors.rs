//! Error types for the server manager.
//!
//! Component-local failures are converted into incidents at each component
//! boundary; only startup and restart-bound exhaustion end the process.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to launch server: {0}")]
    Launch(String),

    #[error("Control channel connection failed: {0}")]
    Connect(String),

    #[error("Control channel authentication rejected")]
    Auth,

    #[error("No response to control command within {0:?}")]
    Timeout(Duration),

    #[error("Control channel protocol error: {0}")]
    Protocol(String),

    #[error("Backup copy failed: {0}")]
    BackupCopy(String),

    #[error("Remote sync failed: {0}")]
    Sync(String),

    #[error("Mail delivery failed: {0}")]
    Mail(String),

    #[error("Catalog error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Catalog pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = ManagerError::Timeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "No response to control command within 10s");
    }
}
