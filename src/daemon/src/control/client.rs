use hostlink_core::error::{HostlinkError, Result};
use hostlink_core::status::Status;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::protocol::{Request, Response};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for a daemon's control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    path: PathBuf,
}

impl ControlClient {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Send one request and wait for its response.
    pub async fn request(&self, request: &Request) -> Result<Response> {
        tokio::time::timeout(REQUEST_TIMEOUT, self.exchange(request))
            .await
            .map_err(|_| {
                HostlinkError::TimeoutError(format!(
                    "no reply on control socket {}",
                    self.path.display()
                ))
            })?
    }

    async fn exchange(&self, request: &Request) -> Result<Response> {
        let stream = UnixStream::connect(&self.path).await?;
        let (reader, mut writer) = stream.into_split();

        let mut bytes = serde_json::to_vec(request)?;
        bytes.push(b'\n');
        writer.write_all(&bytes).await?;
        writer.flush().await?;

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await?;
        if line.trim().is_empty() {
            return Err(HostlinkError::ProtocolError(
                "daemon closed the control connection without replying".to_string(),
            ));
        }
        match serde_json::from_str(line.trim())? {
            Response::Error { message } => Err(HostlinkError::DaemonError(message)),
            response => Ok(response),
        }
    }

    pub async fn ping(&self) -> Result<Response> {
        self.request(&Request::Ping).await
    }

    pub async fn status(&self) -> Result<Status> {
        match self.request(&Request::Status).await? {
            Response::Status { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stop(&self) -> Result<()> {
        match self.request(&Request::Stop).await? {
            Response::Stopping => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> HostlinkError {
    HostlinkError::ProtocolError(format!("unexpected response: {response:?}"))
}
