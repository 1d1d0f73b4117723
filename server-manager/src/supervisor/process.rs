//! Handle on one launched game-server process.

use crate::config::ServerConfig;
use crate::utils::errors::{ManagerError, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// What to run and where
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl From<&ServerConfig> for LaunchSpec {
    fn from(config: &ServerConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            args: config.args.clone(),
            working_dir: config.folder.clone(),
        }
    }
}

#[derive(Debug)]
pub enum StopOutcome {
    /// The process exited within the grace period
    Exited(ExitStatus),
    /// The grace period ran out and the process was killed
    Killed,
}

pub struct ServerProcess {
    child: Child,
    pid: Option<u32>,
}

impl ServerProcess {
    /// Launch the server in its own process group so a terminal Ctrl+C
    /// reaches only the manager, which then stops the server itself.
    pub fn start(spec: &LaunchSpec) -> Result<Self> {
        if !spec.working_dir.is_dir() {
            return Err(ManagerError::Launch(format!(
                "working directory {} does not exist",
                spec.working_dir.display()
            )));
        }

        let child = Command::new(&spec.executable)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ManagerError::Launch(format!("{}: {}", spec.executable, e)))?;

        let pid = child.id();
        info!(pid, executable = %spec.executable, "Server process launched");

        Ok(Self { child, pid })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Wait until the process terminates
    pub async fn await_exit(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Send SIGTERM and wait up to `timeout`, then SIGKILL
    pub async fn request_graceful_stop(&mut self, timeout: Duration) -> Result<StopOutcome> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(StopOutcome::Exited(status));
        }

        if let Some(pid) = self.pid {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, "Failed to send SIGTERM: {}", e);
            }
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(StopOutcome::Exited(status?)),
            Err(_) => {
                warn!(pid = self.pid, "Server ignored SIGTERM for {:?}, killing it", timeout);
                self.child.kill().await?;
                Ok(StopOutcome::Killed)
            }
        }
    }
}

/// Human-readable exit status, e.g. `exit code 1` or `signal 9 (SIGKILL)`
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {}", code);
    }
    match status.signal() {
        Some(sig) => match Signal::try_from(sig) {
            Ok(named) => format!("signal {} ({})", sig, named.as_str()),
            Err(_) => format!("signal {}", sig),
        },
        None => "unknown exit status".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            executable: "sh".into(),
            args: vec!["-c".into(), script.into()],
            working_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_exit_status_is_reported() {
        let mut process = ServerProcess::start(&sh("exit 3")).unwrap();
        let status = process.await_exit().await.unwrap();
        assert_eq!(describe_exit(&status), "exit code 3");
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_error() {
        let spec = LaunchSpec {
            executable: "/nonexistent/server-binary".into(),
            args: vec![],
            working_dir: std::env::temp_dir(),
        };
        let err = ServerProcess::start(&spec).err().unwrap();
        assert!(matches!(err, ManagerError::Launch(_)));
    }

    #[tokio::test]
    async fn test_graceful_stop_within_timeout() {
        let mut process = ServerProcess::start(&sh("exec sleep 30")).unwrap();
        let outcome = process
            .request_graceful_stop(Duration::from_secs(5))
            .await
            .unwrap();
        match outcome {
            StopOutcome::Exited(status) => assert_eq!(describe_exit(&status), "signal 15 (SIGTERM)"),
            StopOutcome::Killed => panic!("sleep should honour SIGTERM"),
        }
    }

    #[tokio::test]
    async fn test_ignored_sigterm_is_killed() {
        let mut process = ServerProcess::start(&sh("trap '' TERM; exec sleep 30")).unwrap();
        // Let the shell install the trap before signalling.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = process
            .request_graceful_stop(Duration::from_millis(200))
            .await
            .unwrap();
        assert!(matches!(outcome, StopOutcome::Killed));
    }
}
