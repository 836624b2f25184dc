use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{HostlinkError, Result};

/// Default profile name
pub const DEFAULT_PROFILE: &str = "default";

/// Default interval between container volume discovery passes
pub const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 3;

/// A named profile and the on-disk locations derived from it.
///
/// Layout: `<root>/<name>/daemon/{daemon.pid, daemon.sock, ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Profile name
    pub name: String,

    /// Base directory holding all profiles (`~/.hostlink`)
    pub root: PathBuf,
}

impl Profile {
    /// Create a profile rooted under `~/.hostlink`.
    pub fn new(name: &str) -> Result<Self> {
        validate_name(name)?;
        let home = dirs::home_dir().ok_or_else(|| {
            HostlinkError::ConfigError("cannot determine home directory".to_string())
        })?;
        Ok(Self::with_root(name, home.join(".hostlink")))
    }

    /// Create a profile under an explicit root directory.
    pub fn with_root(name: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            root: root.into(),
        }
    }

    /// Profile directory (`<root>/<name>`)
    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    /// Daemon working directory
    pub fn daemon_dir(&self) -> PathBuf {
        self.dir().join("daemon")
    }

    /// Profile configuration file
    pub fn config_file(&self) -> PathBuf {
        self.dir().join("hostlink.yaml")
    }

    /// PID file of the daemon process
    pub fn pid_file(&self) -> PathBuf {
        self.daemon_dir().join("daemon.pid")
    }

    /// Control socket served by the daemon
    pub fn control_socket(&self) -> PathBuf {
        self.daemon_dir().join("daemon.sock")
    }

    /// Daemon log file (stderr of the detached process)
    pub fn log_file(&self) -> PathBuf {
        self.daemon_dir().join("daemon.log")
    }

    /// QEMU-protocol socket served by the user-space network
    pub fn gvproxy_socket(&self) -> PathBuf {
        self.daemon_dir().join("gvproxy.sock")
    }
}

/// Check that a profile name is a single plain path component.
///
/// Profile names end up in paths owned by root (the vmnet run directory),
/// so separators, leading dots and anything outside `[A-Za-z0-9._-]` are
/// rejected.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(HostlinkError::ConfigError(format!(
            "invalid profile name '{name}': use letters, digits, '.', '-' or '_'"
        )))
    }
}

/// Workers requested for a daemon run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSelection {
    /// Privileged shared-network switch
    #[serde(default)]
    pub vmnet: bool,

    /// User-space network stack
    #[serde(default)]
    pub gvproxy: bool,

    /// Bind-mount change propagation
    #[serde(default)]
    pub inotify: bool,
}

impl WorkerSelection {
    /// Whether at least one worker is selected.
    pub fn any(&self) -> bool {
        self.vmnet || self.gvproxy || self.inotify
    }
}

/// Container runtime running inside the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Containerd,
}

impl ContainerRuntime {
    /// Guest CLI used to list and inspect containers.
    pub fn cli(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Containerd => "nerdctl",
        }
    }
}

impl std::str::FromStr for ContainerRuntime {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "docker" => Ok(Self::Docker),
            "containerd" => Ok(Self::Containerd),
            _ => Err(format!(
                "unknown container runtime: '{}' (supported: docker, containerd)",
                s
            )),
        }
    }
}

/// Daemon configuration, passed explicitly from the CLI to the detached
/// daemon process (serialized as JSON on the re-exec command line).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Profile the daemon serves
    pub profile: Profile,

    /// Workers to supervise
    pub workers: WorkerSelection,

    /// Verbose (debug) logging in the daemon
    #[serde(default)]
    pub verbose: bool,

    /// Extra DNS hosts: hostname → IP or another hostname
    #[serde(default)]
    pub dns_hosts: HashMap<String, String>,

    /// Host directories mounted into the VM (mount roots)
    #[serde(default)]
    pub mounts: Vec<PathBuf>,

    /// Container runtime inside the guest
    #[serde(default)]
    pub runtime: ContainerRuntime,

    /// Command prefix that executes a command inside the guest
    #[serde(default)]
    pub guest_shell: Option<Vec<String>>,

    /// Seconds between container volume discovery passes
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
}

fn default_discovery_interval() -> u64 {
    DEFAULT_DISCOVERY_INTERVAL_SECS
}

impl DaemonConfig {
    /// Create a configuration with no workers selected.
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            workers: WorkerSelection::default(),
            verbose: false,
            dns_hosts: HashMap::new(),
            mounts: Vec::new(),
            runtime: ContainerRuntime::default(),
            guest_shell: None,
            discovery_interval_secs: DEFAULT_DISCOVERY_INTERVAL_SECS,
        }
    }

    /// Load the profile's `hostlink.yaml` if present, otherwise defaults.
    pub fn load(profile: Profile) -> Result<Self> {
        let path = profile.config_file();
        let mut config = Self::new(profile);
        if !path.exists() {
            return Ok(config);
        }

        let data = std::fs::read_to_string(&path).map_err(|e| {
            HostlinkError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        let file: ProfileFile = serde_yaml::from_str(&data)?;
        tracing::debug!(path = %path.display(), "Loaded profile configuration");
        file.apply(&mut config);
        Ok(config)
    }

    /// Guest command prefix, defaulting to `limactl shell <profile>`.
    pub fn guest_shell(&self) -> Vec<String> {
        match &self.guest_shell {
            Some(shell) if !shell.is_empty() => shell.clone(),
            _ => vec![
                "limactl".to_string(),
                "shell".to_string(),
                self.profile.name.clone(),
            ],
        }
    }

    /// Encode for the daemon re-exec command line.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the daemon re-exec command line.
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| HostlinkError::ConfigError(format!("invalid daemon config: {}", e)))
    }
}

/// On-disk profile configuration (`hostlink.yaml`).
#[derive(Debug, Default, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    workers: Option<WorkerSelection>,
    #[serde(default)]
    dns_hosts: HashMap<String, String>,
    #[serde(default)]
    mounts: Vec<PathBuf>,
    #[serde(default)]
    runtime: Option<ContainerRuntime>,
    #[serde(default)]
    guest_shell: Option<Vec<String>>,
    #[serde(default)]
    discovery_interval_secs: Option<u64>,
}

impl ProfileFile {
    fn apply(self, config: &mut DaemonConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config.dns_hosts = self.dns_hosts;
        config.mounts = self.mounts.iter().map(|p| expand_home(p)).collect();
        if let Some(runtime) = self.runtime {
            config.runtime = runtime;
        }
        config.guest_shell = self.guest_shell;
        if let Some(interval) = self.discovery_interval_secs {
            config.discovery_interval_secs = interval.max(1);
        }
    }
}

/// Expand a leading `~` to the home directory.
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_profile_paths() {
        let profile = Profile::with_root("dev", "/tmp/hl");
        assert_eq!(profile.dir(), PathBuf::from("/tmp/hl/dev"));
        assert_eq!(profile.daemon_dir(), PathBuf::from("/tmp/hl/dev/daemon"));
        assert_eq!(profile.pid_file(), PathBuf::from("/tmp/hl/dev/daemon/daemon.pid"));
        assert_eq!(
            profile.control_socket(),
            PathBuf::from("/tmp/hl/dev/daemon/daemon.sock")
        );
        assert_eq!(
            profile.gvproxy_socket(),
            PathBuf::from("/tmp/hl/dev/daemon/gvproxy.sock")
        );
    }

    #[test]
    fn test_validate_name() {
        for name in ["default", "dev-2", "work_vm", "a.b"] {
            validate_name(name).unwrap();
        }
        for name in ["", ".", "..", "../etc", "a/b", "/abs", ".hidden", "sp ace", &"x".repeat(65)] {
            assert!(
                matches!(validate_name(name), Err(HostlinkError::ConfigError(_))),
                "{name:?}"
            );
        }
    }

    #[test]
    fn test_profile_new_rejects_traversal() {
        assert!(Profile::new("../../etc").is_err());
    }

    #[test]
    fn test_worker_selection_any() {
        assert!(!WorkerSelection::default().any());
        let selection = WorkerSelection {
            inotify: true,
            ..Default::default()
        };
        assert!(selection.any());
    }

    #[test]
    fn test_container_runtime_from_str() {
        assert_eq!("docker".parse::<ContainerRuntime>().unwrap(), ContainerRuntime::Docker);
        assert_eq!(
            "containerd".parse::<ContainerRuntime>().unwrap(),
            ContainerRuntime::Containerd
        );
        assert!("podman".parse::<ContainerRuntime>().is_err());
        assert_eq!(ContainerRuntime::Containerd.cli(), "nerdctl");
    }

    #[test]
    fn test_guest_shell_default() {
        let config = DaemonConfig::new(Profile::with_root("work", "/tmp/hl"));
        assert_eq!(config.guest_shell(), vec!["limactl", "shell", "work"]);
    }

    #[test]
    fn test_guest_shell_override() {
        let mut config = DaemonConfig::new(Profile::with_root("work", "/tmp/hl"));
        config.guest_shell = Some(vec!["ssh".to_string(), "vm".to_string()]);
        assert_eq!(config.guest_shell(), vec!["ssh", "vm"]);
    }

    #[test]
    fn test_json_roundtrip_keeps_workers() {
        let mut config = DaemonConfig::new(Profile::with_root("default", "/tmp/hl"));
        config.workers.gvproxy = true;
        config
            .dns_hosts
            .insert("example.test".to_string(), "10.0.0.1".to_string());

        let parsed = DaemonConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert!(parsed.workers.gvproxy);
        assert!(!parsed.workers.vmnet);
        assert_eq!(parsed.dns_hosts.get("example.test").unwrap(), "10.0.0.1");
        assert_eq!(parsed.profile, config.profile);
    }

    #[test]
    fn test_from_json_invalid() {
        let err = DaemonConfig::from_json("not json").unwrap_err();
        assert!(matches!(err, HostlinkError::ConfigError(_)));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = DaemonConfig::load(Profile::with_root("default", dir.path())).unwrap();
        assert!(!config.workers.any());
        assert_eq!(config.discovery_interval_secs, DEFAULT_DISCOVERY_INTERVAL_SECS);
        assert_eq!(config.runtime, ContainerRuntime::Docker);
    }

    #[test]
    fn test_load_profile_file() {
        let dir = TempDir::new().unwrap();
        let profile = Profile::with_root("default", dir.path());
        std::fs::create_dir_all(profile.dir()).unwrap();
        std::fs::write(
            profile.config_file(),
            "workers:\n  gvproxy: true\n  inotify: true\n\
             dns_hosts:\n  db.local: 10.0.0.5\n\
             mounts:\n  - /srv/projects\n\
             runtime: containerd\n\
             discovery_interval_secs: 0\n",
        )
        .unwrap();

        let config = DaemonConfig::load(profile).unwrap();
        assert!(config.workers.gvproxy);
        assert!(config.workers.inotify);
        assert!(!config.workers.vmnet);
        assert_eq!(config.dns_hosts.get("db.local").unwrap(), "10.0.0.5");
        assert_eq!(config.mounts, vec![PathBuf::from("/srv/projects")]);
        assert_eq!(config.runtime, ContainerRuntime::Containerd);
        assert_eq!(config.discovery_interval_secs, 1);
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/abs")), PathBuf::from("/abs"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/code")), home.join("code"));
        }
    }
}
