//! Process supervisor.
//!
//! Owns the game-server lifecycle as a small state machine:
//!
//! ```text
//! Starting -> Running -> Crashed -> (backoff) -> Starting
//!                     -> Stopping -> Stopped
//! ```
//!
//! Crashes are restarted after a backoff until the sliding-window bound is
//! exceeded; then a single fatal incident is raised and supervision ends.

pub mod process;
pub mod restart;

use crate::config::Config;
use crate::incident::{IncidentSender, Severity};
use crate::utils::format::format_duration;
use process::{describe_exit, LaunchSpec, ServerProcess, StopOutcome};
use restart::{RestartDecision, RestartTracker};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

/// Why supervision ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Shutdown was requested and the server was stopped
    Stopped,
    /// The server exited cleanly on its own
    ServerExited,
    /// Automatic recovery gave up; operator action required
    Halted,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub launch: LaunchSpec,
    pub auto_restart: bool,
    pub stop_timeout: Duration,
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub backoff: Duration,
}

impl From<&Config> for SupervisorSettings {
    fn from(config: &Config) -> Self {
        Self {
            launch: LaunchSpec::from(&config.server),
            auto_restart: config.server.auto_restart,
            stop_timeout: Duration::from_secs(config.server.stop_timeout_secs),
            max_restarts: config.restart.max_restarts,
            restart_window: Duration::from_secs(config.restart.window_secs),
            backoff: Duration::from_secs(config.restart.backoff_secs),
        }
    }
}

pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    incidents: IncidentSender,
    tracker: RestartTracker,
    state: watch::Sender<ProcessState>,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings, incidents: IncidentSender) -> Self {
        let tracker = RestartTracker::new(settings.max_restarts, settings.restart_window);
        let (state, _) = watch::channel(ProcessState::Stopped);
        Self {
            settings,
            incidents,
            tracker,
            state,
        }
    }

    /// Observe lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// Supervise until shutdown is requested, the server exits cleanly, or
    /// recovery gives up.
    pub async fn run(mut self, shutdown: CancellationToken) -> SupervisorExit {
        loop {
            if shutdown.is_cancelled() {
                self.set_state(ProcessState::Stopped);
                return SupervisorExit::Stopped;
            }

            self.set_state(ProcessState::Starting);

            let failure = match ServerProcess::start(&self.settings.launch) {
                Ok(mut process) => {
                    self.set_state(ProcessState::Running);

                    tokio::select! {
                        status = process.await_exit() => match status {
                            Ok(status) if status.success() => {
                                self.set_state(ProcessState::Stopped);
                                self.incidents.report(
                                    Severity::Notice,
                                    "Server exited cleanly without a shutdown request; supervision ends",
                                );
                                return SupervisorExit::ServerExited;
                            }
                            Ok(status) => format!("Server crashed ({})", describe_exit(&status)),
                            Err(e) => format!("Failed to obtain server exit status: {}", e),
                        },
                        _ = shutdown.cancelled() => {
                            return self.stop(process).await;
                        }
                    }
                }
                Err(e) => e.to_string(),
            };

            self.set_state(ProcessState::Crashed);

            if !self.settings.auto_restart {
                self.incidents.report(
                    Severity::Fatal,
                    format!("{}. Auto-restart is disabled.", failure),
                );
                return SupervisorExit::Halted;
            }

            match self.tracker.record_crash(Instant::now()) {
                RestartDecision::GiveUp { crashes } => {
                    self.incidents.report(
                        Severity::Fatal,
                        format!(
                            "{}. {} crashes within {}; automatic restart halted.",
                            failure,
                            crashes,
                            format_duration(self.tracker.window().as_secs())
                        ),
                    );
                    return SupervisorExit::Halted;
                }
                RestartDecision::Restart { attempt } => {
                    self.incidents.report(Severity::Warning, failure);
                    self.incidents.report(
                        Severity::Notice,
                        format!(
                            "Restarting server in {} (restart {} of {} allowed within {})",
                            format_duration(self.settings.backoff.as_secs()),
                            attempt,
                            self.tracker.max_restarts(),
                            format_duration(self.tracker.window().as_secs())
                        ),
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.backoff) => {}
                _ = shutdown.cancelled() => {
                    self.set_state(ProcessState::Stopped);
                    return SupervisorExit::Stopped;
                }
            }
        }
    }

    async fn stop(&mut self, mut process: ServerProcess) -> SupervisorExit {
        self.set_state(ProcessState::Stopping);
        info!(pid = process.id(), "Requesting server shutdown");

        match process.request_graceful_stop(self.settings.stop_timeout).await {
            Ok(StopOutcome::Exited(status)) => {
                info!("Server stopped ({})", describe_exit(&status));
            }
            Ok(StopOutcome::Killed) => {
                self.incidents.report(
                    Severity::ForcedKill,
                    format!(
                        "Server did not stop within {} and was killed",
                        format_duration(self.settings.stop_timeout.as_secs())
                    ),
                );
            }
            Err(e) => warn!("Error while stopping server: {}", e),
        }

        self.set_state(ProcessState::Stopped);
        SupervisorExit::Stopped
    }

    fn set_state(&self, state: ProcessState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "Server state changed");
        }
    }
}
