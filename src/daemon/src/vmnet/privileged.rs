//! Entry points of the privileged vmnet helper.
//!
//! These run as root through the sudoers rule, re-entering this binary via
//! the helper symlink. The caller only chooses a profile name; every path
//! is derived from it inside the root-owned run directory.

use hostlink_core::config::validate_name;
use hostlink_core::error::{HostlinkError, Result};
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::{DHCP_END, GATEWAY, NAME, RUN_DIR, VMNET_BINARY};
use crate::pidfile;

/// Files of one profile's switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmnetPaths {
    pub pid_file: PathBuf,
    pub socket: PathBuf,
}

impl VmnetPaths {
    /// Paths under `run_dir`. The profile name must be a plain component.
    pub fn new(run_dir: &Path, profile: &str) -> Result<Self> {
        validate_name(profile)?;
        Ok(Self {
            pid_file: run_dir.join(format!("{profile}.pid")),
            socket: run_dir.join(format!("{profile}.ptp")),
        })
    }

    /// Paths under the root-owned run directory.
    pub fn for_profile(profile: &str) -> Result<Self> {
        Self::new(Path::new(RUN_DIR), profile)
    }

    /// PTP socket plus the `+`-suffixed variant some hypervisors create.
    pub fn socket_artifacts(&self) -> [PathBuf; 2] {
        let mut plus = self.socket.clone().into_os_string();
        plus.push("+");
        [self.socket.clone(), PathBuf::from(plus)]
    }

    fn remove_artifacts(&self) {
        for path in self.socket_artifacts() {
            pidfile::remove(&path);
        }
    }
}

/// Arguments passed to `socket_vmnet`.
pub fn vmnet_args(paths: &VmnetPaths) -> Vec<String> {
    vec![
        "--vmnet-mode".to_string(),
        "shared".to_string(),
        "--vmnet-gateway".to_string(),
        GATEWAY.to_string(),
        "--vmnet-dhcp-end".to_string(),
        DHCP_END.to_string(),
        "--pidfile".to_string(),
        paths.pid_file.to_string_lossy().to_string(),
        paths.socket.to_string_lossy().to_string(),
    ]
}

/// Replace the current process with `socket_vmnet`. Only returns on failure.
pub fn start(profile: &str) -> Result<()> {
    let paths = VmnetPaths::for_profile(profile)?;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(RUN_DIR)?;
    paths.remove_artifacts();

    let err = Command::new(VMNET_BINARY).args(vmnet_args(&paths)).exec();
    Err(HostlinkError::ProcessError {
        name: NAME.to_string(),
        message: format!("failed to exec {VMNET_BINARY}: {err}"),
    })
}

/// SIGTERM the profile's switch and remove its files.
pub fn stop(profile: &str) -> Result<()> {
    stop_at(&VmnetPaths::for_profile(profile)?)
}

/// Succeed only if the profile's switch is alive.
pub fn check(profile: &str) -> Result<()> {
    check_at(&VmnetPaths::for_profile(profile)?)
}

fn stop_at(paths: &VmnetPaths) -> Result<()> {
    let pid = pidfile::read(&paths.pid_file).ok_or_else(|| HostlinkError::NotRunning(NAME.to_string()))?;
    if !pidfile::signal(pid, libc::SIGTERM) {
        return Err(HostlinkError::ProcessError {
            name: NAME.to_string(),
            message: format!("failed to signal pid {pid}: {}", std::io::Error::last_os_error()),
        });
    }
    paths.remove_artifacts();
    pidfile::remove(&paths.pid_file);
    Ok(())
}

fn check_at(paths: &VmnetPaths) -> Result<()> {
    match pidfile::running(&paths.pid_file) {
        Some(_) => Ok(()),
        None => Err(HostlinkError::NotRunning(NAME.to_string())),
    }
}
