//! Process-backed implementations of the host and guest capability traits.

use async_trait::async_trait;
use hostlink_core::actions::{FileInfo, GuestActions, HostActions};
use hostlink_core::error::{HostlinkError, Result};
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Runs commands directly on the host.
#[derive(Debug, Clone, Default)]
pub struct LocalHost;

impl LocalHost {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostActions for LocalHost {
    async fn run(&self, args: &[&str]) -> Result<()> {
        let output = command(args)?.output().await?;
        check_output(args, &output)
    }

    async fn run_quiet(&self, args: &[&str]) -> Result<()> {
        let status = command(args)?
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(HostlinkError::command(args, status.to_string()))
        }
    }

    async fn run_output(&self, args: &[&str]) -> Result<String> {
        let output = command(args)?.output().await?;
        check_output(args, &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_interactive(&self, args: &[&str]) -> Result<()> {
        let status = command(args)?
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(HostlinkError::command(args, status.to_string()))
        }
    }

    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = tokio::fs::metadata(path).await?;
        Ok(FileInfo {
            size: metadata.len(),
            mode: metadata.permissions().mode() & 0o7777,
            is_dir: metadata.is_dir(),
        })
    }
}

/// Runs commands inside the guest through a shell prefix
/// such as `limactl shell <instance>`.
#[derive(Debug, Clone)]
pub struct ShellGuest {
    prefix: Vec<String>,
}

impl ShellGuest {
    pub fn new(prefix: Vec<String>) -> Self {
        Self { prefix }
    }

    fn argv<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        self.prefix
            .iter()
            .map(String::as_str)
            .chain(args.iter().copied())
            .collect()
    }
}

#[async_trait]
impl GuestActions for ShellGuest {
    async fn run(&self, args: &[&str]) -> Result<()> {
        LocalHost.run(&self.argv(args)).await
    }

    async fn run_quiet(&self, args: &[&str]) -> Result<()> {
        LocalHost.run_quiet(&self.argv(args)).await
    }

    async fn run_output(&self, args: &[&str]) -> Result<String> {
        LocalHost.run_output(&self.argv(args)).await
    }

    async fn run_interactive(&self, args: &[&str]) -> Result<()> {
        LocalHost.run_interactive(&self.argv(args)).await
    }

    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let script = format!("cat > {}", shell_quote(&path.to_string_lossy()));
        let argv = self.argv(&["sh", "-c", &script]);

        let mut child = command(&argv)?
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(contents).await?;
        }
        let output = child.wait_with_output().await?;
        check_output(&argv, &output)
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let path = path.to_string_lossy();
        let out = self.run_output(&["stat", "-c", "%s %f", &path]).await?;
        parse_guest_stat(&out)
    }
}

fn command(args: &[&str]) -> Result<Command> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| HostlinkError::Other("empty command".to_string()))?;
    let mut cmd = Command::new(program);
    cmd.args(rest).kill_on_drop(true);
    Ok(cmd)
}

fn check_output(args: &[&str], output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    tracing::debug!(command = %args.join(" "), status = %output.status, %stderr, "Command failed");
    let message = if stderr.is_empty() {
        output.status.to_string()
    } else {
        stderr
    };
    Err(HostlinkError::command(args, message))
}

/// Parse `stat -c '%s %f'` output: size in bytes and raw mode in hex.
fn parse_guest_stat(out: &str) -> Result<FileInfo> {
    let mut fields = out.split_whitespace();
    let size = fields.next().and_then(|s| s.parse::<u64>().ok());
    let raw = fields.next().and_then(|s| u32::from_str_radix(s, 16).ok());
    match (size, raw) {
        (Some(size), Some(raw)) => Ok(FileInfo {
            size,
            mode: raw & 0o7777,
            is_dir: raw & 0o170000 == 0o040000,
        }),
        _ => Err(HostlinkError::Other(format!("unexpected stat output: {out}"))),
    }
}

/// Single-quote a string for `sh -c`.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
