//! Daemon status snapshot.

use serde::{Deserialize, Serialize};

/// Liveness of a single supervised worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    /// Worker name
    pub name: String,
    /// Whether the worker reported itself alive
    pub running: bool,
    /// Liveness failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate daemon status. A snapshot, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Whether the daemon process is up
    pub running: bool,
    /// Per-worker liveness
    #[serde(default)]
    pub processes: Vec<ProcessStatus>,
}

impl Status {
    /// Status of a daemon that is not running.
    pub fn stopped() -> Self {
        Self::default()
    }

    /// Whether the daemon and every worker are up.
    pub fn healthy(&self) -> bool {
        self.running && self.processes.iter().all(|p| p.running)
    }
}
