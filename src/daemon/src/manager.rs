//! CLI-side lifecycle of the detached daemon.

use hostlink_core::actions::HostActions;
use hostlink_core::config::{DaemonConfig, Profile};
use hostlink_core::error::{HostlinkError, Result};
use hostlink_core::status::Status;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use crate::control::ControlClient;
use crate::deps::Dependencies;
use crate::host::LocalHost;
use crate::pidfile;
use crate::process;

/// Default time allowed for a daemon to exit after a stop request.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

const READY_INTERVAL: Duration = Duration::from_millis(200);
const READY_ATTEMPTS: u32 = 50;

/// Starts, queries and stops the daemon of a profile.
pub struct Manager {
    host: Arc<dyn HostActions>,
    /// Program and leading arguments that re-enter this binary.
    launcher: Vec<PathBuf>,
}

impl Manager {
    /// Manager that re-executes the current binary.
    pub fn new() -> Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::with_launcher(Arc::new(LocalHost::new()), vec![exe]))
    }

    pub fn with_launcher(host: Arc<dyn HostActions>, launcher: Vec<PathBuf>) -> Self {
        Self { host, launcher }
    }

    /// Start a daemon for `config`, replacing any running one.
    pub async fn start(&self, config: &DaemonConfig) -> Result<()> {
        let profile = &config.profile;
        self.stop(profile, DEFAULT_STOP_TIMEOUT).await?;
        std::fs::create_dir_all(profile.daemon_dir())?;

        let processes = process::processes(config);
        Dependencies::of(&processes).ensure(self.host.as_ref()).await?;

        let mut child = self.spawn(config)?;
        tracing::info!(pid = child.id(), profile = %profile.name, "Daemon launched");

        let client = ControlClient::new(profile.control_socket());
        for _ in 0..READY_ATTEMPTS {
            if client.ping().await.is_ok() {
                tracing::info!(profile = %profile.name, "Daemon ready");
                return Ok(());
            }
            if let Some(status) = child.try_wait()? {
                return Err(HostlinkError::DaemonError(format!(
                    "daemon exited during startup ({status}); see {}",
                    profile.log_file().display()
                )));
            }
            tokio::time::sleep(READY_INTERVAL).await;
        }
        Err(HostlinkError::TimeoutError(format!(
            "daemon did not become ready; see {}",
            profile.log_file().display()
        )))
    }

    fn spawn(&self, config: &DaemonConfig) -> Result<std::process::Child> {
        let (program, prefix) = self
            .launcher
            .split_first()
            .ok_or_else(|| HostlinkError::DaemonError("empty daemon launcher".to_string()))?;

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.profile.log_file())?;

        let child = Command::new(program)
            .args(prefix)
            .args(["daemon", "run", "--config"])
            .arg(config.to_json()?)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            // Detach from the terminal's process group so Ctrl-C does not reach it.
            .process_group(0)
            .spawn()?;
        Ok(child)
    }

    /// Status of the profile's daemon. An unreachable daemon is reported as stopped.
    pub async fn running(&self, profile: &Profile) -> Status {
        if pidfile::running(&profile.pid_file()).is_none() {
            return Status::stopped();
        }
        match ControlClient::new(profile.control_socket()).status().await {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(error = %e, "Daemon did not answer status request");
                Status::stopped()
            }
        }
    }

    /// Stop the profile's daemon, killing it if it outlives `timeout`.
    pub async fn stop(&self, profile: &Profile, timeout: Duration) -> Result<()> {
        let Some(pid) = pidfile::running(&profile.pid_file()) else {
            remove_stale_files(profile);
            return Ok(());
        };

        tracing::info!(pid, profile = %profile.name, "Stopping daemon");
        if let Err(e) = ControlClient::new(profile.control_socket()).stop().await {
            tracing::warn!(pid, error = %e, "Stop request failed, sending SIGTERM");
            pidfile::signal(pid, libc::SIGTERM);
        }

        if !pidfile::wait_for_exit(pid, timeout).await {
            tracing::warn!(pid, timeout_secs = timeout.as_secs(), "Daemon did not exit in time, killing");
            pidfile::signal(pid, libc::SIGKILL);
            if !pidfile::wait_for_exit(pid, Duration::from_secs(5)).await {
                return Err(HostlinkError::TimeoutError(format!("daemon {pid} did not exit")));
            }
        }

        remove_stale_files(profile);
        tracing::info!(pid, "Daemon stopped");
        Ok(())
    }
}

fn remove_stale_files(profile: &Profile) {
    pidfile::remove(&profile.pid_file());
    pidfile::remove(&profile.control_socket());
}
