use chrono::{DateTime, Utc};
use hostlink_core::status::Status;
use serde::{Deserialize, Serialize};

/// Request from the CLI to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Check that the daemon is up
    Ping,
    /// Liveness of every worker
    Status,
    /// Shut the daemon down
    Stop,
}

/// Response from the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong {
        pid: u32,
        version: String,
        started_at: DateTime<Utc>,
    },
    Status {
        status: Status,
    },
    /// Shutdown has begun
    Stopping,
    Error {
        message: String,
    },
}
