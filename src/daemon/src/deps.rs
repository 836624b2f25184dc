//! Host prerequisites for workers and the composite installer.
//!
//! Each worker declares the dependencies it needs before it can run.
//! [`Dependencies`] folds them into one unit so the caller can check
//! everything at once and warn about a sudo prompt only a single time.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use hostlink_core::actions::HostActions;
use hostlink_core::error::{HostlinkError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::process::Process;

/// A host prerequisite. Implementations are stateless and idempotent.
#[async_trait]
pub trait Dependency: Send + Sync {
    /// Short description for logs.
    fn name(&self) -> String;

    /// Whether the prerequisite is already in place.
    async fn installed(&self) -> bool;

    /// Put the prerequisite in place.
    async fn install(&self, host: &dyn HostActions) -> Result<()>;
}

struct Entry {
    process: &'static str,
    deps: Vec<Box<dyn Dependency>>,
    root: bool,
}

/// Dependencies of a set of workers, folded into one.
pub struct Dependencies {
    entries: Vec<Entry>,
}

impl Dependencies {
    /// Collect the dependencies of every process.
    pub fn of(processes: &[Arc<dyn Process>]) -> Self {
        let entries = processes
            .iter()
            .map(|p| {
                let (deps, root) = p.dependencies();
                Entry {
                    process: p.name(),
                    deps,
                    root,
                }
            })
            .collect();
        Self { entries }
    }

    /// True only if every dependency of every process is installed.
    pub async fn installed(&self) -> bool {
        for entry in &self.entries {
            for dep in &entry.deps {
                if !dep.installed().await {
                    return false;
                }
            }
        }
        true
    }

    /// Whether any *missing* dependency belongs to a process that needs root.
    pub async fn root_required(&self) -> bool {
        for entry in self.entries.iter().filter(|e| e.root) {
            for dep in &entry.deps {
                if !dep.installed().await {
                    return true;
                }
            }
        }
        false
    }

    /// Install every missing dependency in order.
    pub async fn install(&self, host: &dyn HostActions) -> Result<()> {
        for entry in &self.entries {
            for dep in &entry.deps {
                if dep.installed().await {
                    continue;
                }
                tracing::info!(process = entry.process, dependency = %dep.name(), "Installing dependency");
                dep.install(host)
                    .await
                    .map_err(|e| HostlinkError::DependencyError {
                        process: entry.process.to_string(),
                        message: e.to_string(),
                    })?;
            }
        }
        Ok(())
    }

    /// Install missing dependencies, warning once beforehand when a sudo
    /// password may be requested.
    pub async fn ensure(&self, host: &dyn HostActions) -> Result<()> {
        if self.installed().await {
            return Ok(());
        }
        if self.root_required().await {
            tracing::warn!("dependencies missing for the requested network; sudo password may be required");
        }
        self.install(host).await
    }
}

/// Scoped sudoers fragment granting passwordless access to specific commands.
pub struct SudoersFile {
    path: PathBuf,
    contents: String,
}

impl SudoersFile {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

#[async_trait]
impl Dependency for SudoersFile {
    fn name(&self) -> String {
        format!("sudoers file {}", self.path.display())
    }

    async fn installed(&self) -> bool {
        match std::fs::read_to_string(&self.path) {
            Ok(existing) => existing == self.contents,
            // sudoers fragments are usually 0440 root; existence is all we can check.
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => true,
            Err(_) => false,
        }
    }

    async fn install(&self, host: &dyn HostActions) -> Result<()> {
        let staged = tempfile::NamedTempFile::new()?;
        std::fs::write(staged.path(), &self.contents)?;
        let staged_path = staged.path().to_string_lossy().to_string();
        let target = self.path.to_string_lossy().to_string();

        if let Some(parent) = self.path.parent() {
            let parent = parent.to_string_lossy();
            host.run_interactive(&["sudo", "mkdir", "-p", &parent]).await?;
        }
        host.run_interactive(&["sudo", "visudo", "-c", "-f", &staged_path])
            .await?;
        host.run_interactive(&["sudo", "install", "-m", "0440", &staged_path, &target])
            .await
    }
}

/// Tarball of privileged binaries unpacked into a root-owned directory.
pub struct ArchiveDependency {
    archive: &'static [u8],
    dir: PathBuf,
    required: PathBuf,
}

impl ArchiveDependency {
    /// `required` is a path relative to `dir` that must be present in the archive.
    pub fn new(archive: &'static [u8], dir: impl Into<PathBuf>, required: impl Into<PathBuf>) -> Self {
        Self {
            archive,
            dir: dir.into(),
            required: required.into(),
        }
    }

    fn files(&self) -> Result<Vec<PathBuf>> {
        if self.archive.is_empty() {
            return Err(HostlinkError::Other(
                "vmnet assets are not embedded in this build".to_string(),
            ));
        }
        archive_files(self.archive)
    }
}

#[async_trait]
impl Dependency for ArchiveDependency {
    fn name(&self) -> String {
        format!("binaries in {}", self.dir.display())
    }

    async fn installed(&self) -> bool {
        match self.files() {
            Ok(files) => !files.is_empty() && files.iter().all(|f| self.dir.join(f).exists()),
            Err(_) => false,
        }
    }

    async fn install(&self, host: &dyn HostActions) -> Result<()> {
        let files = self.files()?;
        if !files.iter().any(|f| f == &self.required) {
            return Err(HostlinkError::Other(format!(
                "archive does not contain {}",
                self.required.display()
            )));
        }

        let staging = tempfile::tempdir()?;
        tar::Archive::new(GzDecoder::new(self.archive)).unpack(staging.path())?;

        let source = format!("{}/.", staging.path().display());
        let dir = self.dir.to_string_lossy();
        host.run_interactive(&["sudo", "mkdir", "-p", &dir]).await?;
        host.run_interactive(&["sudo", "cp", "-R", &source, &dir]).await
    }
}

/// Regular files contained in a gzipped tarball, as relative paths.
pub fn archive_files(data: &[u8]) -> Result<Vec<PathBuf>> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut files = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        if entry.header().entry_type().is_file() {
            let path = entry.path()?;
            files.push(path.components().collect::<PathBuf>());
        }
    }
    Ok(files)
}

/// Symlink pointing at the current executable.
pub struct SymlinkDependency {
    link: PathBuf,
    target: Option<PathBuf>,
}

impl SymlinkDependency {
    pub fn new(link: impl Into<PathBuf>, target: Option<PathBuf>) -> Self {
        Self {
            link: link.into(),
            target,
        }
    }

    /// Link to the running binary.
    pub fn to_current_exe(link: impl Into<PathBuf>) -> Self {
        Self::new(link, std::env::current_exe().ok())
    }
}

#[async_trait]
impl Dependency for SymlinkDependency {
    fn name(&self) -> String {
        format!("symlink {}", self.link.display())
    }

    async fn installed(&self) -> bool {
        match (&self.target, std::fs::read_link(&self.link)) {
            (Some(target), Ok(current)) => &current == target,
            _ => false,
        }
    }

    async fn install(&self, host: &dyn HostActions) -> Result<()> {
        let target = self.target.as_deref().ok_or_else(|| {
            HostlinkError::Other("cannot determine the current executable".to_string())
        })?;
        let link = self.link.to_string_lossy();
        if let Some(parent) = self.link.parent().map(Path::to_string_lossy) {
            host.run_interactive(&["sudo", "mkdir", "-p", &parent]).await?;
        }
        let target = target.to_string_lossy();
        host.run_interactive(&["sudo", "ln", "-sfn", &target, &link])
            .await
    }
}
