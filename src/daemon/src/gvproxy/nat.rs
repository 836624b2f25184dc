//! UDP flows from the guest relayed through host sockets.

use hostlink_core::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::network::NetworkConfig;
use super::switch::to_guest;

/// Flows with no traffic in either direction for this long are closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    guest_port: u16,
    dst: SocketAddrV4,
}

#[derive(Clone)]
struct Flow {
    socket: Arc<UdpSocket>,
    last_used: Arc<Mutex<Instant>>,
}

type FlowTable = Arc<Mutex<HashMap<FlowKey, Flow>>>;

pub struct UdpNat {
    net: Arc<NetworkConfig>,
    out: mpsc::Sender<Vec<u8>>,
    token: CancellationToken,
    flows: FlowTable,
    idle: Duration,
}

impl UdpNat {
    pub fn new(net: Arc<NetworkConfig>, out: mpsc::Sender<Vec<u8>>, token: CancellationToken) -> Self {
        Self {
            net,
            out,
            token,
            flows: Arc::new(Mutex::new(HashMap::new())),
            idle: IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    /// Number of open flows.
    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send a guest datagram to `dst`, opening a flow on first use.
    pub async fn send(&self, guest_port: u16, dst: SocketAddrV4, payload: &[u8]) -> Result<()> {
        let key = FlowKey { guest_port, dst };
        let existing = self.flows.lock().get(&key).cloned();
        let flow = match existing {
            Some(flow) => flow,
            None => self.open(key).await?,
        };
        *flow.last_used.lock() = Instant::now();
        flow.socket.send(payload).await?;
        Ok(())
    }

    async fn open(&self, key: FlowKey) -> Result<Flow> {
        let target = SocketAddr::new(self.net.host_destination(*key.dst.ip()), key.dst.port());
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(target).await?;

        let flow = Flow {
            socket: Arc::new(socket),
            last_used: Arc::new(Mutex::new(Instant::now())),
        };
        // Another datagram may have raced us here; keep the first flow.
        let flow = {
            let mut flows = self.flows.lock();
            if let Some(existing) = flows.get(&key) {
                return Ok(existing.clone());
            }
            flows.insert(key, flow.clone());
            flow
        };
        tracing::debug!(guest_port = key.guest_port, dst = %key.dst, %target, "Opened UDP flow");

        tokio::spawn(relay(
            key,
            flow.clone(),
            self.flows.clone(),
            self.net.clone(),
            self.out.clone(),
            self.token.clone(),
            self.idle,
        ));
        Ok(flow)
    }
}

/// Copy host replies back to the guest until the flow idles out.
async fn relay(
    key: FlowKey,
    flow: Flow,
    flows: FlowTable,
    net: Arc<NetworkConfig>,
    out: mpsc::Sender<Vec<u8>>,
    token: CancellationToken,
    idle: Duration,
) {
    let guest = SocketAddrV4::new(net.guest_ip, key.guest_port);
    let mut buf = vec![0u8; 65_536];
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            r = tokio::time::timeout(idle, flow.socket.recv(&mut buf)) => r,
        };
        match received {
            Ok(Ok(len)) => {
                *flow.last_used.lock() = Instant::now();
                if out.send(to_guest(&net, key.dst, guest, &buf[..len])).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(dst = %key.dst, error = %e, "UDP flow receive failed");
                break;
            }
            Err(_) => {
                let last_used = *flow.last_used.lock();
                if last_used.elapsed() >= idle {
                    break;
                }
            }
        }
    }

    let mut flows = flows.lock();
    if flows
        .get(&key)
        .is_some_and(|current| Arc::ptr_eq(&current.socket, &flow.socket))
    {
        flows.remove(&key);
    }
    tracing::debug!(guest_port = key.guest_port, dst = %key.dst, "Closed UDP flow");
}
