//! Control socket round trips against a live supervisor.

use async_trait::async_trait;
use hostlink_core::error::{HostlinkError, Result};
use hostlink_daemon::{ControlClient, ControlServer, Dependency, Process, Response, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Idle(&'static str);

#[async_trait]
impl Process for Idle {
    fn name(&self) -> &'static str {
        self.0
    }

    async fn start(&self, token: CancellationToken) -> Result<()> {
        token.cancelled().await;
        Ok(())
    }

    async fn alive(&self) -> Result<()> {
        if self.0 == "broken" {
            Err(HostlinkError::NotRunning(self.0.to_string()))
        } else {
            Ok(())
        }
    }

    fn dependencies(&self) -> (Vec<Box<dyn Dependency>>, bool) {
        (Vec::new(), false)
    }
}

#[tokio::test]
async fn test_status_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("daemon.sock");

    let supervisor = Arc::new(Supervisor::new(vec![
        Arc::new(Idle("gvproxy")),
        Arc::new(Idle("broken")),
    ]));
    let token = CancellationToken::new();
    let server = ControlServer::bind(&socket, supervisor.clone()).unwrap();
    let server_task = tokio::spawn(server.run(token.clone()));
    let supervisor_task = {
        let supervisor = supervisor.clone();
        let token = token.clone();
        tokio::spawn(async move { supervisor.run(token).await })
    };

    let client = ControlClient::new(&socket);
    match client.ping().await.unwrap() {
        Response::Pong { pid, .. } => assert_eq!(pid, std::process::id()),
        other => panic!("unexpected response {other:?}"),
    }

    let status = client.status().await.unwrap();
    assert!(status.running);
    assert_eq!(status.processes.len(), 2);
    assert!(status.processes[0].running);
    assert!(!status.processes[1].running);
    assert!(!status.healthy());

    client.stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), supervisor_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap();
    assert!(token.is_cancelled());
}

#[tokio::test]
async fn test_invalid_request_gets_error() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("daemon.sock");
    let token = CancellationToken::new();
    let server = ControlServer::bind(&socket, Arc::new(Supervisor::new(Vec::new()))).unwrap();
    tokio::spawn(server.run(token.clone()));

    let mut stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
    stream.write_all(b"{\"type\":\"reboot\"}\n").await.unwrap();
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).await.unwrap();
    let response: Response = serde_json::from_str(line.trim()).unwrap();
    assert!(matches!(response, Response::Error { .. }));

    token.cancel();
}

#[tokio::test]
async fn test_socket_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("daemon.sock");
    std::fs::write(&socket, "stale").unwrap();

    let _server = ControlServer::bind(&socket, Arc::new(Supervisor::new(Vec::new()))).unwrap();
    let mode = std::fs::metadata(&socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn test_client_without_daemon_fails() {
    let dir = tempfile::tempdir().unwrap();
    let client = ControlClient::new(dir.path().join("absent.sock"));
    assert!(client.status().await.is_err());
}

#[tokio::test]
async fn test_socket_removed_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("daemon.sock");

    let server = ControlServer::bind(&socket, Arc::new(Supervisor::new(Vec::new()))).unwrap();
    assert!(socket.exists());
    let token = CancellationToken::new();
    let task = tokio::spawn(server.run(token.clone()));
    token.cancel();
    task.await.unwrap();
    assert!(!socket.exists());

    // Already gone: dropping a second server must not fail.
    let server = ControlServer::bind(&socket, Arc::new(Supervisor::new(Vec::new()))).unwrap();
    std::fs::remove_file(&socket).unwrap();
    drop(server);
    assert!(!socket.exists());
}
