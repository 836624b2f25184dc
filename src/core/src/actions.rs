//! Capability traits for the host and the guest VM.
//!
//! The daemon never shells out directly; every external command goes
//! through one of these traits so workers can be exercised with fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Minimal file metadata returned by `stat` on either side of the VM boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Size in bytes
    pub size: u64,
    /// Permission bits (e.g. `0o644`)
    pub mode: u32,
    /// Whether the path is a directory
    pub is_dir: bool,
}

/// Commands and file operations on the host.
#[async_trait]
pub trait HostActions: Send + Sync {
    /// Run a command, logging its output on failure.
    async fn run(&self, args: &[&str]) -> Result<()>;

    /// Run a command, discarding all output.
    async fn run_quiet(&self, args: &[&str]) -> Result<()>;

    /// Run a command and return its trimmed stdout.
    async fn run_output(&self, args: &[&str]) -> Result<String>;

    /// Run a command attached to the current terminal (e.g. for a sudo prompt).
    async fn run_interactive(&self, args: &[&str]) -> Result<()>;

    /// Write a file on the host.
    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Stat a file on the host.
    async fn stat(&self, path: &Path) -> Result<FileInfo>;
}

/// Commands and file operations inside the guest VM.
#[async_trait]
pub trait GuestActions: Send + Sync {
    /// Run a command in the guest, logging its output on failure.
    async fn run(&self, args: &[&str]) -> Result<()>;

    /// Run a command in the guest, discarding all output.
    async fn run_quiet(&self, args: &[&str]) -> Result<()>;

    /// Run a command in the guest and return its trimmed stdout.
    async fn run_output(&self, args: &[&str]) -> Result<String>;

    /// Run a command in the guest attached to the current terminal.
    async fn run_interactive(&self, args: &[&str]) -> Result<()>;

    /// Write a file inside the guest.
    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Stat a file inside the guest.
    async fn stat(&self, path: &Path) -> Result<FileInfo>;
}
