//! Propagates host file changes in bind-mounted volumes into the guest.
//!
//! Shared filesystems do not carry inotify events across the VM boundary,
//! so containers never see edits made on the host. This worker watches the
//! host side of every bind mount used by a running container and re-applies
//! the file's mode inside the guest, which raises the event there.

pub mod limiter;
pub mod volumes;
pub mod watcher;

use async_trait::async_trait;
use hostlink_core::actions::GuestActions;
use hostlink_core::config::{ContainerRuntime, DaemonConfig};
use hostlink_core::error::{HostlinkError, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::deps::Dependency;
use crate::process::Process;
use limiter::EventLimiter;

pub const NAME: &str = "inotify";

/// How long a superseded watch keeps running after a new one starts.
const WATCH_HANDOVER: Duration = Duration::from_millis(500);
const EVENT_QUEUE: usize = 1024;

/// A host file change to replay in the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModEvent {
    pub path: PathBuf,
    pub mode: u32,
}

impl ModEvent {
    /// Read the current mode of `path`; `None` if it no longer exists.
    pub fn from_path(path: &Path) -> Option<Self> {
        let metadata = std::fs::metadata(path).ok()?;
        Some(Self {
            path: path.to_path_buf(),
            mode: metadata.permissions().mode() & 0o7777,
        })
    }

    /// Touch the file inside the guest by re-applying its mode.
    pub async fn apply(&self, guest: &dyn GuestActions) -> Result<()> {
        let mode = format!("{:o}", self.mode);
        let path = self.path.to_string_lossy();
        guest.run_quiet(&["chmod", &mode, &path]).await
    }
}

pub struct Inotify {
    guest: Arc<dyn GuestActions>,
    runtime: ContainerRuntime,
    roots: Vec<PathBuf>,
    interval: Duration,
    running: AtomicBool,
}

impl Inotify {
    pub fn new(config: &DaemonConfig, guest: Arc<dyn GuestActions>) -> Self {
        Self {
            guest,
            runtime: config.runtime,
            roots: config.mounts.clone(),
            interval: Duration::from_secs(config.discovery_interval_secs.max(1)),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Periodically rediscover volumes and publish the set when it changes.
    async fn discover_loop(&self, token: CancellationToken, volumes: watch::Sender<Vec<PathBuf>>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match volumes::discover(self.guest.as_ref(), self.runtime, &self.roots).await {
                Ok(found) => {
                    let changed = volumes.send_if_modified(|current| {
                        if *current == found {
                            return false;
                        }
                        *current = found.clone();
                        true
                    });
                    if changed {
                        tracing::info!(count = found.len(), volumes = ?found, "Watched volumes changed");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "Volume discovery failed"),
            }
        }
    }

    /// Replace the host watch whenever the volume set changes.
    async fn watch_loop(
        &self,
        token: CancellationToken,
        mut volumes: watch::Receiver<Vec<PathBuf>>,
        events: mpsc::Sender<PathBuf>,
    ) {
        let mut current: Option<CancellationToken> = None;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = volumes.changed() => if changed.is_err() { break },
            }
            let dirs = volumes.borrow_and_update().clone();

            let child = token.child_token();
            tokio::spawn(run_watch(dirs, events.clone(), child.clone()));

            if let Some(previous) = current.replace(child) {
                tokio::spawn(async move {
                    tokio::time::sleep(WATCH_HANDOVER).await;
                    previous.cancel();
                });
            }
        }
        if let Some(current) = current {
            current.cancel();
        }
    }

    /// Forward rate-limited events to the guest.
    async fn event_loop(&self, token: CancellationToken, mut events: mpsc::Receiver<PathBuf>) {
        let mut limiter = EventLimiter::default();
        loop {
            let path = tokio::select! {
                _ = token.cancelled() => break,
                path = events.recv() => match path {
                    Some(path) => path,
                    None => break,
                },
            };
            if !limiter.allow(&path, Instant::now()) {
                continue;
            }
            let Some(event) = ModEvent::from_path(&path) else {
                continue;
            };
            let guest = self.guest.clone();
            tokio::spawn(async move {
                match event.apply(guest.as_ref()).await {
                    Ok(()) => tracing::trace!(path = %event.path.display(), "Touched guest file"),
                    Err(e) => tracing::debug!(path = %event.path.display(), error = %e, "Guest touch failed"),
                }
            });
        }
    }
}

async fn run_watch(dirs: Vec<PathBuf>, events: mpsc::Sender<PathBuf>, token: CancellationToken) {
    if dirs.is_empty() {
        return;
    }
    let _watcher = match watcher::watch(&dirs, events) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to start volume watch");
            return;
        }
    };
    token.cancelled().await;
    tracing::debug!(count = dirs.len(), "Volume watch stopped");
}

#[async_trait]
impl Process for Inotify {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn start(&self, token: CancellationToken) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(roots = ?self.roots, runtime = self.runtime.cli(), "Volume watcher started");

        let (volumes_tx, volumes_rx) = watch::channel(Vec::new());
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        tokio::join!(
            self.discover_loop(token.clone(), volumes_tx),
            self.watch_loop(token.clone(), volumes_rx, events_tx),
            self.event_loop(token.clone(), events_rx),
        );

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Volume watcher stopped");
        Ok(())
    }

    async fn alive(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HostlinkError::NotRunning(NAME.to_string()))
        }
    }

    fn dependencies(&self) -> (Vec<Box<dyn Dependency>>, bool) {
        (Vec::new(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_core::actions::FileInfo;
    use hostlink_core::config::Profile;
    use parking_lot::Mutex;

    /// Guest reporting one container that bind-mounts `source`.
    struct RecordingGuest {
        source: PathBuf,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingGuest {
        fn chmods(&self) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .iter()
                .filter(|c| c[0] == "chmod")
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl GuestActions for RecordingGuest {
        async fn run(&self, args: &[&str]) -> Result<()> {
            self.run_quiet(args).await
        }
        async fn run_quiet(&self, args: &[&str]) -> Result<()> {
            self.calls.lock().push(args.iter().map(|s| s.to_string()).collect());
            Ok(())
        }
        async fn run_output(&self, args: &[&str]) -> Result<String> {
            match args.get(1) {
                Some(&"ps") => Ok("c1".to_string()),
                _ => Ok(format!(
                    r#"[{{"Type":"bind","Source":"{}"}}]"#,
                    self.source.display()
                )),
            }
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

    fn worker(root: &Path, guest: Arc<RecordingGuest>) -> Inotify {
        let mut config = DaemonConfig::new(Profile::with_root("default", "/tmp/hostlink-inotify"));
        config.mounts = vec![root.to_path_buf()];
        Inotify::new(&config, guest).with_interval(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_mod_event_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, "x").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();

        let event = ModEvent::from_path(&path).unwrap();
        assert_eq!(event.mode, 0o640);

        let guest = Arc::new(RecordingGuest {
            source: PathBuf::new(),
            calls: Mutex::new(Vec::new()),
        });
        event.apply(guest.as_ref()).await.unwrap();
        assert_eq!(
            guest.chmods(),
            vec![vec!["chmod".to_string(), "640".to_string(), path.to_string_lossy().to_string()]]
        );
        assert!(ModEvent::from_path(&dir.path().join("missing")).is_none());
    }

    /// Poll until the guest has seen `count` chmods, giving up after a second.
    async fn wait_for_chmods(guest: &RecordingGuest, count: usize) -> usize {
        for _ in 0..50 {
            if guest.chmods().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        guest.chmods().len()
    }

    #[tokio::test]
    async fn test_burst_on_one_path_touches_once() {
        let dir = tempfile::tempdir().unwrap();
        let hot = dir.path().join("hot.txt");
        let other = dir.path().join("other.txt");
        std::fs::write(&hot, "x").unwrap();
        std::fs::write(&other, "x").unwrap();

        let guest = Arc::new(RecordingGuest {
            source: dir.path().to_path_buf(),
            calls: Mutex::new(Vec::new()),
        });
        let inotify = worker(dir.path(), guest.clone());

        let (tx, rx) = mpsc::channel(64);
        for _ in 0..20 {
            tx.send(hot.clone()).await.unwrap();
        }
        tx.send(other.clone()).await.unwrap();
        drop(tx);
        inotify.event_loop(CancellationToken::new(), rx).await;

        assert_eq!(wait_for_chmods(&guest, 2).await, 2);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let touched: Vec<String> = guest.chmods().into_iter().map(|c| c[2].clone()).collect();
        assert_eq!(touched.len(), 2);
        assert_eq!(touched.iter().filter(|p| **p == hot.to_string_lossy()).count(), 1);
        assert_eq!(touched.iter().filter(|p| **p == other.to_string_lossy()).count(), 1);
    }

    #[tokio::test]
    async fn test_host_write_reaches_guest() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let guest = Arc::new(RecordingGuest {
            source: root.clone(),
            calls: Mutex::new(Vec::new()),
        });
        let inotify = Arc::new(worker(&root, guest.clone()));

        let token = CancellationToken::new();
        let task = {
            let inotify = inotify.clone();
            let token = token.clone();
            tokio::spawn(async move { inotify.start(token).await })
        };

        let file = root.join("edited.txt");
        let mut touched = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(inotify.alive().await.is_ok());
            std::fs::write(&file, "change").unwrap();
            if guest.chmods().iter().any(|c| c[2] == file.to_string_lossy()) {
                touched = true;
                break;
            }
        }
        token.cancel();
        task.await.unwrap().unwrap();

        assert!(touched);
        assert!(inotify.alive().await.is_err());
    }

    #[tokio::test]
    async fn test_same_mode_chmod_does_not_reach_guest() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let guest = Arc::new(RecordingGuest {
            source: root.clone(),
            calls: Mutex::new(Vec::new()),
        });
        let inotify = Arc::new(worker(&root, guest.clone()));

        let token = CancellationToken::new();
        let task = {
            let inotify = inotify.clone();
            let token = token.clone();
            tokio::spawn(async move { inotify.start(token).await })
        };

        // Wait for the watch to be established.
        let file = root.join("mode.txt");
        let mut touched = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(&file, "change").unwrap();
            if !guest.chmods().is_empty() {
                touched = true;
                break;
            }
        }
        assert!(touched);
        tokio::time::sleep(limiter::WINDOW * 2).await;
        let before = guest.chmods().len();

        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(mode)).unwrap();
        tokio::time::sleep(limiter::WINDOW * 3).await;

        token.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(guest.chmods().len(), before);
    }
}
