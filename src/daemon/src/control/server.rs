use chrono::{DateTime, Utc};
use hostlink_core::error::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::protocol::{Request, Response};
use crate::supervisor::Supervisor;

/// Serves [`Request`]s on a Unix socket until shutdown.
pub struct ControlServer {
    path: PathBuf,
    listener: UnixListener,
    supervisor: Arc<Supervisor>,
    started_at: DateTime<Utc>,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale one. Only the owner may connect.
    pub fn bind(path: &Path, supervisor: Arc<Supervisor>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!(socket = %path.display(), "Control socket listening");

        Ok(Self {
            path: path.to_path_buf(),
            listener,
            supervisor,
            started_at: Utc::now(),
        })
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// A `Stop` request cancels `shutdown` after replying.
    pub async fn run(self, shutdown: CancellationToken) {
        let server = Arc::new(self);
        loop {
            tokio::select! {
                conn = server.listener.accept() => match conn {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&server);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, &shutdown).await {
                                tracing::debug!(error = %e, "Control connection error");
                            }
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "Control socket accept error"),
                },
                _ = shutdown.cancelled() => break,
            }
        }
        tracing::debug!(socket = %server.path.display(), "Control socket closed");
    }

    async fn handle_connection(&self, stream: UnixStream, shutdown: &CancellationToken) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await?;

        let response = match serde_json::from_str::<Request>(line.trim()) {
            Ok(request) => self.handle_request(request, shutdown).await,
            Err(e) => Response::Error {
                message: format!("invalid request: {e}"),
            },
        };

        let mut bytes = serde_json::to_vec(&response)?;
        bytes.push(b'\n');
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn handle_request(&self, request: Request, shutdown: &CancellationToken) -> Response {
        tracing::debug!(?request, "Control request");
        match request {
            Request::Ping => Response::Pong {
                pid: std::process::id(),
                version: hostlink_core::VERSION.to_string(),
                started_at: self.started_at,
            },
            Request::Status => Response::Status {
                status: self.supervisor.status().await,
            },
            Request::Stop => {
                tracing::info!("Stop requested over control socket");
                shutdown.cancel();
                Response::Stopping
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        crate::pidfile::remove(&self.path);
    }
}
