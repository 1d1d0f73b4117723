//! Remote sync dispatcher.
//!
//! Mirrors the whole local backup root to an rclone remote after each
//! committed snapshot, so remote retention follows local retention. A
//! failed sync never touches the local catalog.

use crate::backup::snapshot::STAGING_PREFIX;
use crate::config::BackupConfig;
use crate::utils::errors::{ManagerError, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(30);

/// rclone exit code for "directory not found"
const EXIT_DIRECTORY_NOT_FOUND: i32 = 3;

#[derive(Debug, Clone)]
pub struct RemoteSync {
    binary: String,
    remote: String,
    attempts: u32,
    retry_delay: Duration,
    low_priority: bool,
}

impl RemoteSync {
    pub fn new(binary: impl Into<String>, remote: impl Into<String>, attempts: u32) -> Self {
        Self {
            binary: binary.into(),
            remote: remote.into(),
            attempts: attempts.max(1),
            retry_delay: RETRY_DELAY,
            low_priority: false,
        }
    }

    /// None when no remote is configured
    pub fn from_config(config: &BackupConfig) -> Option<Self> {
        config.rclone_path.as_ref().map(|remote| {
            Self::new(&config.rclone_binary, remote, config.sync_attempts)
                .with_low_priority(config.sync_low_priority)
        })
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run the tool under `nice -n 10 ionice -c 3`
    pub fn with_low_priority(mut self, enabled: bool) -> Self {
        self.low_priority = enabled;
        self
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    fn command(&self) -> Command {
        let mut command = if self.low_priority {
            let mut command = Command::new("nice");
            command.args(["-n", "10", "ionice", "-c", "3"]).arg(&self.binary);
            command
        } else {
            Command::new(&self.binary)
        };
        command.stdin(Stdio::null()).stdout(Stdio::null()).kill_on_drop(true);
        command
    }

    /// Check that the sync tool runs and the remote answers. A remote
    /// directory that does not exist yet is fine; the first sync creates it.
    pub async fn verify(&self) -> Result<()> {
        let status = self
            .command()
            .arg("version")
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ManagerError::Config(format!("{} is not available: {}", self.binary, e)))?;
        if !status.success() {
            return Err(ManagerError::Config(format!(
                "{} is not usable ({})",
                self.binary, status
            )));
        }

        let output = self
            .command()
            .args(["lsf", "--max-depth", "1"])
            .arg(&self.remote)
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ManagerError::Config(format!("failed to run {}: {}", self.binary, e)))?;

        match output.status.code() {
            Some(0) | Some(EXIT_DIRECTORY_NOT_FOUND) => Ok(()),
            _ => Err(ManagerError::Config(format!(
                "remote {} is not reachable: {}",
                self.remote,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    /// Mirror `local` to the remote, retrying up to the configured attempts.
    /// Once `shutdown` fires, the running attempt is killed and no further
    /// attempt is made.
    pub async fn sync(&self, local: &Path, shutdown: &CancellationToken) -> Result<()> {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => None,
                result = self.sync_once(local) => Some(result),
            };

            match outcome {
                None => {
                    warn!(remote = %self.remote, attempt, "Remote sync interrupted by shutdown");
                    return Err(ManagerError::Sync("interrupted by shutdown".into()));
                }
                Some(Ok(())) => {
                    info!(remote = %self.remote, attempt, "Remote sync complete");
                    return Ok(());
                }
                Some(Err(e)) => {
                    warn!(remote = %self.remote, attempt, attempts = self.attempts, "Remote sync attempt failed: {}", e);
                    last_error = Some(e);
                }
            }

            if attempt < self.attempts {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ManagerError::Sync("no sync attempt was made".into())))
    }

    async fn sync_once(&self, local: &Path) -> Result<()> {
        let output = self
            .command()
            .arg("sync")
            .arg(local)
            .arg(&self.remote)
            .arg("--exclude")
            .arg(format!("{}*/**", STAGING_PREFIX))
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ManagerError::Sync(format!("failed to run {}: {}", self.binary, e)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ManagerError::Sync(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Instant;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_successful_sync() {
        let dir = TempDir::new().unwrap();
        let remote = RemoteSync::new("true", "remote:backups", 3);
        remote.sync(dir.path(), &CancellationToken::new()).await.unwrap();
        remote.verify().await.unwrap();
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("attempts.log");
        let tool = script(dir.path(), "bounded", "echo \"$1\" >> \"$3\"\necho boom >&2\nexit 1\n");

        let remote = RemoteSync::new(tool.to_string_lossy(), counter.to_string_lossy(), 3)
            .with_retry_delay(Duration::from_millis(1));
        let err = remote
            .sync(dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ManagerError::Sync(ref m) if m.contains("boom")));
        let attempts = fs::read_to_string(&counter).unwrap();
        assert_eq!(attempts.lines().collect::<Vec<_>>(), vec!["sync"; 3]);
    }

    #[tokio::test]
    async fn test_shutdown_skips_remaining_attempts() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("attempts.log");
        let tool = script(dir.path(), "failing", "echo \"$1\" >> \"$3\"\nexit 1\n");

        let remote = RemoteSync::new(tool.to_string_lossy(), counter.to_string_lossy(), 5)
            .with_retry_delay(Duration::from_secs(60));
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        assert!(remote.sync(dir.path(), &token).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(fs::read_to_string(&counter).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_running_attempt() {
        let dir = TempDir::new().unwrap();
        let tool = script(dir.path(), "slow", "exec sleep 30\n");
        let remote = RemoteSync::new(tool.to_string_lossy(), "remote:", 1);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let err = remote.sync(dir.path(), &token).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(err, ManagerError::Sync(ref m) if m.contains("shutdown")));
    }

    #[tokio::test]
    async fn test_verify_checks_remote() {
        let dir = TempDir::new().unwrap();

        let missing_dir = script(dir.path(), "fresh", "[ \"$1\" = lsf ] && exit 3\nexit 0\n");
        RemoteSync::new(missing_dir.to_string_lossy(), "remote:new", 1)
            .verify()
            .await
            .unwrap();

        let unreachable = script(dir.path(), "unreachable", "[ \"$1\" = lsf ] && { echo 'no such remote' >&2; exit 1; }\nexit 0\n");
        let err = RemoteSync::new(unreachable.to_string_lossy(), "nowhere:", 1)
            .verify()
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Config(ref m) if m.contains("no such remote")));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = TempDir::new().unwrap();
        let remote = RemoteSync::new("/nonexistent/rclone", "remote:", 1);
        assert!(matches!(
            remote.sync(dir.path(), &CancellationToken::new()).await,
            Err(ManagerError::Sync(_))
        ));
        assert!(matches!(remote.verify().await, Err(ManagerError::Config(_))));
    }
}
