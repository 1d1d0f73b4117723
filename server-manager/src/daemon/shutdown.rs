//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! Shutdown runs in stages, each stage owning a cancellation token:
//! - the backup timer stops scheduling and lets an in-flight snapshot finish
//! - the supervisor asks the game server to stop and waits for it
//! - the incident reporter drains what is left and exits

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    backups: CancellationToken,
    supervisor: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        Self {
            backups: CancellationToken::new(),
            supervisor: CancellationToken::new(),
        }
    }

    /// Token observed by the backup timer loop
    pub fn backup_token(&self) -> CancellationToken {
        self.backups.clone()
    }

    /// Token observed by the process supervisor
    pub fn supervisor_token(&self) -> CancellationToken {
        self.supervisor.clone()
    }

    /// Stop future backup ticks; a snapshot already running is not interrupted
    pub fn stop_backups(&self) {
        info!("Stopping backup scheduler");
        self.backups.cancel();
    }

    /// Ask the supervisor to stop the game server
    pub fn stop_supervisor(&self) {
        info!("Stopping process supervisor");
        self.supervisor.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for SIGTERM or SIGINT
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating graceful shutdown...");
    }

    Ok(())
}
