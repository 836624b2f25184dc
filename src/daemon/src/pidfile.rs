//! PID files and process liveness.

use hostlink_core::error::Result;
use std::path::Path;
use std::time::Duration;

/// A PID that addresses exactly one process. Zero and values that wrap to
/// negative `pid_t` would signal process groups or every process.
fn as_pid_t(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|pid| *pid > 0)
}

/// Whether a process with this PID exists.
pub fn is_process_alive(pid: u32) -> bool {
    let Some(raw) = as_pid_t(pid) else {
        return false;
    };
    // EPERM means the process exists but belongs to another user (root helpers).
    let ret = unsafe { libc::kill(raw, 0) };
    let exists = ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

/// An exited process nobody has reaped yet still answers signal 0.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // Format: `pid (comm) state ...`; comm may contain spaces or parens.
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Write the current process ID to `path`.
pub fn write(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(())
}

/// Read a PID file. Missing or malformed files yield `None`.
pub fn read(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<libc::pid_t>().ok())
        .filter(|pid| *pid > 0)
        .map(|pid| pid as u32)
}

/// PID recorded in `path`, if that process is still alive.
pub fn running(path: &Path) -> Option<u32> {
    read(path).filter(|pid| is_process_alive(*pid))
}

/// Remove a file, ignoring "not found".
pub fn remove(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

/// Send `signal` to `pid`. PIDs outside the `pid_t` range are refused.
pub fn signal(pid: u32, signal: i32) -> bool {
    match as_pid_t(pid) {
        Some(raw) => unsafe { libc::kill(raw, signal) == 0 },
        None => {
            tracing::warn!(pid, "Refusing to signal invalid pid");
            false
        }
    }
}

/// Poll until `pid` exits. Returns false when `timeout` expires first.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    loop {
        if !is_process_alive(pid) {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
