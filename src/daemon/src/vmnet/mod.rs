//! Shared-mode virtual switch backed by the privileged `socket_vmnet` binary.
//!
//! The daemon itself never runs as root. It launches the switch through
//! `sudo -n` on the helper symlink, which the sudoers fragment allows
//! without a password, and stops it the same way. The switch's pid file
//! and socket live in a root-owned run directory keyed by profile name.

pub mod privileged;

use async_trait::async_trait;
use hostlink_core::actions::HostActions;
use hostlink_core::config::Profile;
use hostlink_core::error::{HostlinkError, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::deps::{ArchiveDependency, Dependency, SudoersFile, SymlinkDependency};
use crate::process::Process;

pub use privileged::VmnetPaths;

pub const NAME: &str = "vmnet";

/// Root-owned directory holding the switch binaries.
pub const PRIVILEGED_DIR: &str = "/opt/hostlink";
pub const VMNET_BINARY: &str = "/opt/hostlink/bin/socket_vmnet";
/// Symlink to this executable, the only command the sudoers rule permits.
pub const HELPER_LINK: &str = "/opt/hostlink/bin/hostlink-vmnet";
/// Root-owned directory for per-profile pid files and sockets.
pub const RUN_DIR: &str = "/opt/hostlink/run";
pub const SUDOERS_PATH: &str = "/etc/sudoers.d/hostlink";

pub const GATEWAY: &str = "192.168.106.1";
pub const DHCP_END: &str = "192.168.106.254";

/// Helper subcommands the sudoers rule permits.
const HELPER_SUBCOMMANDS: [&str; 3] = ["start", "stop", "check"];

const SOCKET_WAIT_ATTEMPTS: u32 = 50;
const SOCKET_WAIT_INTERVAL: Duration = Duration::from_millis(100);
const HELPER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

static ASSETS: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/vmnet.tar.gz"));

/// Lifecycle of the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmnetState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Sudoers rule granting passwordless access to the helper's `vmnet`
/// subcommands. Only the profile name is left to the caller.
pub fn sudoers_contents() -> String {
    let group = if cfg!(target_os = "macos") { "%admin" } else { "%sudo" };
    let commands: Vec<String> = HELPER_SUBCOMMANDS
        .iter()
        .map(|sub| format!("{HELPER_LINK} vmnet {sub} --profile *"))
        .collect();
    format!("{group} ALL=(root) NOPASSWD:NOSETENV: {}\n", commands.join(", "))
}

pub struct Vmnet {
    profile: String,
    run_dir: PathBuf,
    host: Arc<dyn HostActions>,
    launcher: Vec<String>,
    state: Mutex<VmnetState>,
}

impl Vmnet {
    pub fn new(profile: &Profile, host: Arc<dyn HostActions>) -> Self {
        let launcher = ["sudo", "-n", HELPER_LINK]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self::with_launcher(profile, host, launcher, RUN_DIR)
    }

    /// Use a custom command prefix in place of `sudo -n <helper>` and a
    /// custom run directory.
    pub fn with_launcher(
        profile: &Profile,
        host: Arc<dyn HostActions>,
        launcher: Vec<String>,
        run_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            profile: profile.name.clone(),
            run_dir: run_dir.into(),
            host,
            launcher,
            state: Mutex::new(VmnetState::Stopped),
        }
    }

    pub fn state(&self) -> VmnetState {
        *self.state.lock()
    }

    fn set_state(&self, state: VmnetState) {
        *self.state.lock() = state;
    }

    fn paths(&self) -> Result<VmnetPaths> {
        VmnetPaths::new(&self.run_dir, &self.profile)
    }

    /// Full argv for a helper subcommand.
    fn helper_argv(&self, subcommand: &str) -> Vec<String> {
        let mut argv = self.launcher.clone();
        argv.extend([
            "vmnet".to_string(),
            subcommand.to_string(),
            "--profile".to_string(),
            self.profile.clone(),
        ]);
        argv
    }

    async fn run_helper(&self, subcommand: &str) -> Result<()> {
        let argv = self.helper_argv(subcommand);
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        self.host.run_quiet(&argv).await
    }

    fn spawn_helper(&self) -> Result<Child> {
        let argv = self.helper_argv("start");
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HostlinkError::Other("empty vmnet launcher".to_string()))?;
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| HostlinkError::ProcessError {
                name: NAME.to_string(),
                message: format!("failed to launch helper: {e}"),
            })
    }

    /// Poll for the PTP socket, failing early if the helper exits.
    async fn wait_for_socket(&self, socket: &std::path::Path, child: &mut Child) -> Result<()> {
        for _ in 0..SOCKET_WAIT_ATTEMPTS {
            if socket.exists() {
                return Ok(());
            }
            if let Some(status) = child.try_wait()? {
                return Err(HostlinkError::ProcessError {
                    name: NAME.to_string(),
                    message: format!("helper exited before creating its socket ({status})"),
                });
            }
            tokio::time::sleep(SOCKET_WAIT_INTERVAL).await;
        }
        Err(HostlinkError::TimeoutError(format!(
            "vmnet socket {} did not appear",
            socket.display()
        )))
    }

    /// The privileged `stop` signals the switch and removes its files.
    async fn shutdown(&self, child: &mut Child) {
        self.set_state(VmnetState::Stopping);
        if let Err(e) = self.run_helper("stop").await {
            tracing::warn!(error = %e, "Privileged vmnet stop failed");
        }
        match tokio::time::timeout(HELPER_EXIT_TIMEOUT, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(pid = ?child.id(), "vmnet helper did not exit, killing");
                if let Err(e) = child.start_kill() {
                    tracing::debug!(error = %e, "Failed to kill vmnet helper");
                }
            }
        }
    }
}

#[async_trait]
impl Process for Vmnet {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn start(&self, token: CancellationToken) -> Result<()> {
        let paths = self.paths()?;
        self.set_state(VmnetState::Starting);

        let mut child = match self.spawn_helper() {
            Ok(child) => child,
            Err(e) => {
                self.set_state(VmnetState::Stopped);
                return Err(e);
            }
        };

        if let Err(e) = self.wait_for_socket(&paths.socket, &mut child).await {
            self.shutdown(&mut child).await;
            self.set_state(VmnetState::Stopped);
            return Err(e);
        }

        self.set_state(VmnetState::Running);
        tracing::info!(
            pid = ?child.id(),
            socket = %paths.socket.display(),
            gateway = GATEWAY,
            "vmnet switch started"
        );

        let exited = tokio::select! {
            _ = token.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let result = match exited {
            None => {
                self.shutdown(&mut child).await;
                Ok(())
            }
            Some(status) => Err(HostlinkError::ProcessError {
                name: NAME.to_string(),
                message: match status {
                    Ok(status) => format!("helper exited unexpectedly ({status})"),
                    Err(e) => format!("failed to wait for helper: {e}"),
                },
            }),
        };

        self.set_state(VmnetState::Stopped);
        tracing::info!("vmnet switch stopped");
        result
    }

    async fn alive(&self) -> Result<()> {
        let paths = self.paths()?;
        self.run_helper("check")
            .await
            .map_err(|_| HostlinkError::NotRunning(NAME.to_string()))?;
        if !paths.socket.exists() {
            return Err(HostlinkError::NotRunning(format!(
                "{NAME} socket {}",
                paths.socket.display()
            )));
        }
        Ok(())
    }

    fn dependencies(&self) -> (Vec<Box<dyn Dependency>>, bool) {
        let deps: Vec<Box<dyn Dependency>> = vec![
            Box::new(SudoersFile::new(SUDOERS_PATH, sudoers_contents())),
            Box::new(ArchiveDependency::new(ASSETS, PRIVILEGED_DIR, "bin/socket_vmnet")),
            Box::new(SymlinkDependency::to_current_exe(HELPER_LINK)),
        ];
        (deps, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_core::actions::FileInfo;
    use std::path::Path;

    /// Host whose privileged `stop` removes the given files, standing in for
    /// the root helper tearing down the switch.
    struct FakeHost {
        check_ok: bool,
        removed_on_stop: Vec<PathBuf>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeHost {
        fn new(check_ok: bool, removed_on_stop: Vec<PathBuf>) -> Arc<Self> {
            Arc::new(Self {
                check_ok,
                removed_on_stop,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HostActions for FakeHost {
        async fn run(&self, args: &[&str]) -> Result<()> {
            self.run_quiet(args).await
        }

        async fn run_quiet(&self, args: &[&str]) -> Result<()> {
            self.calls.lock().push(args.join(" "));
            if args.contains(&"check") && !self.check_ok {
                return Err(HostlinkError::command(args, "exit status: 1"));
            }
            if args.contains(&"stop") {
                for path in &self.removed_on_stop {
                    let _ = std::fs::remove_file(path);
                }
            }
            Ok(())
        }

        async fn run_output(&self, _args: &[&str]) -> Result<String> {
            Ok(String::new())
        }

        async fn run_interactive(&self, args: &[&str]) -> Result<()> {
            self.run_quiet(args).await
        }

        async fn write(&self, _path: &Path, _contents: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn stat(&self, _path: &Path) -> Result<FileInfo> {
            Err(HostlinkError::Other("unsupported".to_string()))
        }
    }

    fn sh(script: String) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script, "helper".to_string()]
    }

    #[test]
    fn test_sudoers_rule_targets_helper() {
        let rule = sudoers_contents();
        assert!(rule.contains("NOPASSWD:NOSETENV: /opt/hostlink/bin/hostlink-vmnet vmnet start --profile *"));
        assert!(rule.contains("/opt/hostlink/bin/hostlink-vmnet vmnet stop --profile *"));
        assert!(rule.contains("/opt/hostlink/bin/hostlink-vmnet vmnet check --profile *"));
        assert!(!rule.contains("--root"));
        assert!(rule.ends_with('\n'));
    }

    #[test]
    fn test_helper_argv_carries_only_profile() {
        let profile = Profile::with_root("dev", "/home/u/.hostlink");
        let vmnet = Vmnet::new(&profile, FakeHost::new(true, Vec::new()));
        assert_eq!(
            vmnet.helper_argv("stop"),
            vec!["sudo", "-n", HELPER_LINK, "vmnet", "stop", "--profile", "dev"]
        );
        assert_eq!(vmnet.paths().unwrap().socket, PathBuf::from("/opt/hostlink/run/dev.ptp"));
    }

    #[tokio::test]
    async fn test_invalid_profile_never_reaches_helper() {
        let profile = Profile::with_root("../../etc", "/tmp/hostlink-test");
        let host = FakeHost::new(true, Vec::new());
        let vmnet = Vmnet::new(&profile, host.clone());
        assert!(vmnet.start(CancellationToken::new()).await.is_err());
        assert!(vmnet.alive().await.is_err());
        assert!(host.calls.lock().is_empty());
        assert_eq!(vmnet.state(), VmnetState::Stopped);
    }

    #[test]
    fn test_dependencies_need_root() {
        let profile = Profile::with_root("default", "/tmp/hostlink-test");
        let vmnet = Vmnet::new(&profile, FakeHost::new(true, Vec::new()));
        let (deps, root) = vmnet.dependencies();
        assert!(root);
        assert_eq!(deps.len(), 3);
    }

    #[tokio::test]
    async fn test_alive_requires_check_and_socket() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::with_root("default", dir.path());
        let socket = dir.path().join("default.ptp");

        let vmnet = Vmnet::with_launcher(&profile, FakeHost::new(true, Vec::new()), Vec::new(), dir.path());
        assert!(vmnet.alive().await.is_err());

        std::fs::write(&socket, "").unwrap();
        vmnet.alive().await.unwrap();

        let dead = Vmnet::with_launcher(&profile, FakeHost::new(false, Vec::new()), Vec::new(), dir.path());
        assert!(dead.alive().await.is_err());
    }

    #[tokio::test]
    async fn test_start_fails_when_helper_exits() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::with_root("default", dir.path());
        let vmnet = Vmnet::with_launcher(
            &profile,
            FakeHost::new(true, Vec::new()),
            sh("exit 1".to_string()),
            dir.path(),
        );

        let err = vmnet.start(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("helper exited"));
        assert_eq!(vmnet.state(), VmnetState::Stopped);
    }

    #[tokio::test]
    async fn test_start_runs_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::with_root("default", dir.path());
        let socket = dir.path().join("default.ptp");
        let marker = dir.path().join("running");
        std::fs::write(&marker, "").unwrap();

        let script = format!(
            "touch '{}'; while [ -e '{}' ]; do sleep 0.05; done",
            socket.display(),
            marker.display()
        );
        let host = FakeHost::new(true, vec![marker, socket.clone()]);
        let vmnet = Arc::new(Vmnet::with_launcher(&profile, host.clone(), sh(script), dir.path()));

        let token = CancellationToken::new();
        let task = {
            let vmnet = vmnet.clone();
            let token = token.clone();
            tokio::spawn(async move { vmnet.start(token).await })
        };

        for _ in 0..100 {
            if vmnet.state() == VmnetState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(vmnet.state(), VmnetState::Running);

        token.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(vmnet.state(), VmnetState::Stopped);
        assert!(!socket.exists());
        assert!(host.calls.lock().iter().any(|c| c.ends_with("vmnet stop --profile default")));
    }
}
