//! Host-side recursive directory watching.

use hostlink_core::error::{HostlinkError, Result};
use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Whether an event changed a file's contents or name. Metadata-only
/// changes are excluded: replaying a change in the guest is itself a chmod
/// on the shared file, which would otherwise echo back forever.
pub fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Name(_))
    )
}

/// Watch `dirs` recursively, sending changed paths on `tx`.
///
/// Events are dropped when the channel is full. Directories that cannot be
/// watched are logged and skipped. Watching stops when the returned watcher
/// is dropped.
pub fn watch(dirs: &[PathBuf], tx: mpsc::Sender<PathBuf>) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) => {
            if !is_content_change(&event.kind) {
                return;
            }
            for path in event.paths {
                let _ = tx.try_send(path);
            }
        }
        Err(e) => tracing::warn!(error = %e, "File watcher error"),
    })
    .map_err(|e| HostlinkError::WatchError(e.to_string()))?;

    for dir in dirs {
        match watcher.watch(dir, RecursiveMode::Recursive) {
            Ok(()) => tracing::debug!(dir = %dir.display(), "Watching directory"),
            Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "Failed to watch directory"),
        }
    }
    Ok(watcher)
}
