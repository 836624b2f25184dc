//! User-space network for the guest's second NIC.
//!
//! The VM connects to a QEMU-protocol Unix socket. Frames from it go
//! through a small switch that provides DHCP, DNS (with zones synthesized
//! from the configured hosts), UDP NAT and TCP termination to the host.

pub mod dhcp;
pub mod dns;
pub mod nat;
pub mod network;
pub mod qemu;
pub mod switch;
pub mod tcp;
pub mod zones;

use async_trait::async_trait;
use hostlink_core::config::DaemonConfig;
use hostlink_core::error::{HostlinkError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::deps::Dependency;
use crate::process::Process;
use network::NetworkConfig;
use switch::Switch;

pub const NAME: &str = "gvproxy";

const OUTBOUND_QUEUE: usize = 1024;

/// Removes the socket file when dropped.
struct SocketGuard<'a>(&'a Path);

impl Drop for SocketGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(socket = %self.0.display(), error = %e, "Failed to remove gvproxy socket");
            }
        }
    }
}

pub struct Gvproxy {
    config: DaemonConfig,
    socket: PathBuf,
    running: AtomicBool,
}

impl Gvproxy {
    pub fn new(config: &DaemonConfig) -> Self {
        Self {
            config: config.clone(),
            socket: config.profile.gvproxy_socket(),
            running: AtomicBool::new(false),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// Serve one guest connection on the socket with an explicit network.
    pub async fn serve(&self, token: CancellationToken, net: NetworkConfig) -> Result<()> {
        if let Some(parent) = self.socket.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.socket.exists() {
            std::fs::remove_file(&self.socket)?;
        }
        let listener = UnixListener::bind(&self.socket)?;
        let _guard = SocketGuard(&self.socket);

        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            socket = %self.socket.display(),
            gateway = %net.gateway_ip,
            guest = %net.guest_ip,
            mac = %net.guest_mac,
            "gvproxy listening"
        );

        let result = self.accept_and_pump(&listener, token, net).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn accept_and_pump(
        &self,
        listener: &UnixListener,
        token: CancellationToken,
        net: NetworkConfig,
    ) -> Result<()> {
        let accepted = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let (stream, _) = accepted;
        tracing::info!("Guest connected to gvproxy");

        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
        let session = token.child_token();
        let switch = Switch::new(net, tx, session.clone());

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = qemu::write_frame(&mut writer, &frame).await {
                    tracing::debug!(error = %e, "gvproxy write failed");
                    break;
                }
            }
        });

        let result = loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break Ok(()),
                frame = qemu::read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(Some(frame)) => {
                    if let Err(e) = switch.handle(&frame).await {
                        tracing::trace!(error = %e, "Dropped guest frame");
                    }
                }
                Ok(None) => break Err(HostlinkError::NetworkError("guest disconnected from gvproxy".to_string())),
                Err(e) => break Err(e),
            }
        };

        session.cancel();
        writer_task.abort();
        result
    }
}

#[async_trait]
impl Process for Gvproxy {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn start(&self, token: CancellationToken) -> Result<()> {
        let net = NetworkConfig::for_daemon(&self.config);
        self.serve(token, net).await
    }

    async fn alive(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(HostlinkError::NotRunning(NAME.to_string()));
        }
        if !self.socket.exists() {
            return Err(HostlinkError::NotRunning(format!(
                "{NAME} socket {}",
                self.socket.display()
            )));
        }
        Ok(())
    }

    fn dependencies(&self) -> (Vec<Box<dyn Dependency>>, bool) {
        (Vec::new(), false)
    }
}
