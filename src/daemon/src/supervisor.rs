//! Runs a set of workers together; the first failure stops them all.

use hostlink_core::error::Result;
use hostlink_core::status::{ProcessStatus, Status};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::process::Process;

/// Supervises a fixed set of workers for the lifetime of the daemon.
pub struct Supervisor {
    processes: Vec<Arc<dyn Process>>,
}

impl Supervisor {
    pub fn new(processes: Vec<Arc<dyn Process>>) -> Self {
        Self { processes }
    }

    pub fn processes(&self) -> &[Arc<dyn Process>] {
        &self.processes
    }

    /// Start every worker and block until `token` is cancelled or a worker fails.
    ///
    /// A failing worker cancels its siblings. All workers have exited when
    /// this returns. The first worker error is returned; a clean shutdown
    /// returns `Ok(())`.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let token = token.child_token();
        let mut workers = JoinSet::new();

        for process in &self.processes {
            let process = process.clone();
            let token = token.clone();
            workers.spawn(async move {
                let name = process.name();
                tracing::info!(worker = name, "Starting worker");
                let result = process.start(token.clone()).await;
                match &result {
                    Ok(()) => tracing::info!(worker = name, "Worker stopped"),
                    Err(e) => {
                        tracing::error!(worker = name, error = %e, "Worker failed, stopping all workers");
                        token.cancel();
                    }
                }
                result
            });
        }

        token.cancelled().await;

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(hostlink_core::HostlinkError::DaemonError(format!(
                    "worker task panicked: {e}"
                ))),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Liveness snapshot of every worker.
    pub async fn status(&self) -> Status {
        let mut processes = Vec::with_capacity(self.processes.len());
        for process in &self.processes {
            let error = process.alive().await.err().map(|e| e.to_string());
            processes.push(ProcessStatus {
                name: process.name().to_string(),
                running: error.is_none(),
                error,
            });
        }
        Status {
            running: true,
            processes,
        }
    }
}
