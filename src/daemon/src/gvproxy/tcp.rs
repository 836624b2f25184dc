//! Guest TCP terminated on a smoltcp interface and spliced to host sockets.
//!
//! The interface answers for every destination address. Each guest SYN gets
//! a listening socket on its exact destination; once the handshake is under
//! way a task connects to the same address on the host (the NAT IP maps to
//! loopback) and copies bytes both ways. A refused or timed-out connect
//! resets the guest connection.

use hostlink_core::error::{HostlinkError, Result};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Checksum, Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as NetInstant;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, HardwareAddress, IpAddress, IpCidr, IpListenEndpoint, IpProtocol, Ipv4Address,
    Ipv4Packet, TcpPacket,
};
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use super::network::{NetworkConfig, PREFIX_LEN};

/// Ethernet MTU including the 14-byte header.
const FRAME_MTU: usize = 1514;
const SOCKET_BUFFER: usize = 64 * 1024;
const CHUNK: usize = 16 * 1024;
/// Chunks buffered between the interface and a host socket, per direction.
const FLOW_QUEUE: usize = 16;
const INBOUND_QUEUE: usize = 256;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// A listener whose SYN never arrived is dropped after this long.
const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_POLL_DELAY: Duration = Duration::from_millis(100);

fn to_std(addr: Ipv4Address) -> Ipv4Addr {
    Ipv4Addr::from(addr.0)
}

/// Frames queued in both directions between the switch and the interface.
#[derive(Default)]
struct FrameQueue {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
}

struct RxFrame(Vec<u8>);

impl RxToken for RxFrame {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.0)
    }
}

struct TxFrame<'a>(&'a mut VecDeque<Vec<u8>>);

impl TxToken for TxFrame<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let result = f(&mut frame);
        self.0.push_back(frame);
        result
    }
}

impl Device for FrameQueue {
    type RxToken<'a> = RxFrame where Self: 'a;
    type TxToken<'a> = TxFrame<'a> where Self: 'a;

    fn receive(&mut self, _timestamp: NetInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        Some((RxFrame(frame), TxFrame(&mut self.tx)))
    }

    fn transmit(&mut self, _timestamp: NetInstant) -> Option<Self::TxToken<'_>> {
        Some(TxFrame(&mut self.tx))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = FRAME_MTU;
        // Guests with checksum offload hand over partial checksums.
        caps.checksum.ipv4 = Checksum::Tx;
        caps.checksum.tcp = Checksum::Tx;
        caps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    guest_port: u16,
    dst: SocketAddrV4,
}

/// Opening segment of a guest connection.
struct Syn {
    key: FlowKey,
    src_mac: EthernetAddress,
    src_ip: Ipv4Address,
}

impl Syn {
    /// Parse `frame` as a guest SYN (without ACK).
    fn parse(frame: &[u8]) -> Option<Self> {
        let eth = EthernetFrame::new_checked(frame).ok()?;
        if eth.ethertype() != EthernetProtocol::Ipv4 {
            return None;
        }
        let packet = Ipv4Packet::new_checked(eth.payload()).ok()?;
        if packet.next_header() != IpProtocol::Tcp {
            return None;
        }
        let segment = TcpPacket::new_checked(packet.payload()).ok()?;
        if !segment.syn() || segment.ack() {
            return None;
        }
        Some(Self {
            key: FlowKey {
                guest_port: segment.src_port(),
                dst: SocketAddrV4::new(to_std(packet.dst_addr()), segment.dst_port()),
            },
            src_mac: eth.src_addr(),
            src_ip: packet.src_addr(),
        })
    }
}

struct Pending {
    data: Vec<u8>,
    offset: usize,
}

struct Flow {
    handle: SocketHandle,
    opened: Instant,
    established: bool,
    closed_to_guest: bool,
    /// Guest bytes bound for the host; dropped once the guest half-closes.
    to_host: Option<mpsc::Sender<Vec<u8>>>,
    from_host: mpsc::Receiver<Vec<u8>>,
    pending: Option<Pending>,
    failed: Arc<AtomicBool>,
    token: CancellationToken,
}

/// Handle to the TCP stack task of one guest session.
pub struct TcpStack {
    inbound: mpsc::Sender<Vec<u8>>,
}

impl TcpStack {
    /// Start the stack. Frames for the guest go to `out`; the stack and all
    /// of its flows end with `token`.
    pub fn spawn(net: Arc<NetworkConfig>, out: mpsc::Sender<Vec<u8>>, token: CancellationToken) -> Self {
        let (inbound, rx) = mpsc::channel(INBOUND_QUEUE);
        let stack = Stack::new(net, out, token);
        tokio::spawn(stack.run(rx));
        Self { inbound }
    }

    /// Hand a guest frame (TCP segment or ARP reply) to the stack.
    pub async fn deliver(&self, frame: Vec<u8>) -> Result<()> {
        self.inbound
            .send(frame)
            .await
            .map_err(|_| HostlinkError::NetworkError("TCP stack stopped".to_string()))
    }
}

struct Stack {
    net: Arc<NetworkConfig>,
    iface: Interface,
    device: FrameQueue,
    sockets: SocketSet<'static>,
    flows: HashMap<FlowKey, Flow>,
    out: mpsc::Sender<Vec<u8>>,
    wake: Arc<Notify>,
    token: CancellationToken,
}

impl Stack {
    fn new(net: Arc<NetworkConfig>, out: mpsc::Sender<Vec<u8>>, token: CancellationToken) -> Self {
        let mut device = FrameQueue::default();
        let mut config = Config::new(HardwareAddress::Ethernet(net.gateway_mac));
        config.random_seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x5a94_efe4);

        let mut iface = Interface::new(config, &mut device, NetInstant::now());
        let gateway = Ipv4Address::from_bytes(&net.gateway_ip.octets());
        iface.update_ip_addrs(|addrs| {
            if let Err(cidr) = addrs.push(IpCidr::new(IpAddress::Ipv4(gateway), PREFIX_LEN)) {
                tracing::warn!(%cidr, "Failed to assign gateway address");
            }
        });
        // Destinations routed via our own address are accepted as local.
        if iface.routes_mut().add_default_ipv4_route(gateway).is_err() {
            tracing::warn!("Failed to add default route");
        }
        iface.set_any_ip(true);

        Self {
            net,
            iface,
            device,
            sockets: SocketSet::new(Vec::new()),
            flows: HashMap::new(),
            out,
            wake: Arc::new(Notify::new()),
            token,
        }
    }

    async fn run(mut self, mut inbound: mpsc::Receiver<Vec<u8>>) {
        let token = self.token.clone();
        let wake = self.wake.clone();
        loop {
            self.service_flows();
            let now = NetInstant::now();
            self.iface.poll(now, &mut self.device, &mut self.sockets);
            if !self.flush().await {
                break;
            }
            self.sweep();

            let delay = self
                .iface
                .poll_delay(now, &self.sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
                .unwrap_or(MAX_POLL_DELAY)
                .min(MAX_POLL_DELAY);
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => Some(frame),
                    None => break,
                },
                _ = wake.notified() => None,
                _ = tokio::time::sleep(delay) => None,
            };
            if let Some(frame) = frame {
                self.accept(frame);
            }
        }

        for flow in self.flows.values() {
            flow.token.cancel();
        }
        tracing::debug!(flows = self.flows.len(), "TCP stack stopped");
    }

    /// Queue a guest frame for the interface, opening a flow for a new SYN.
    fn accept(&mut self, frame: Vec<u8>) {
        if let Some(syn) = Syn::parse(&frame) {
            if !self.flows.contains_key(&syn.key) {
                self.open(syn);
            }
        }
        self.device.rx.push_back(frame);
    }

    fn open(&mut self, syn: Syn) {
        let key = syn.key;
        // Teach the interface the guest's MAC so the SYN-ACK is not held for ARP.
        self.device.rx.push_back(arp_reply(&self.net, syn.src_mac, syn.src_ip));

        let mut socket = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0; SOCKET_BUFFER]),
            tcp::SocketBuffer::new(vec![0; SOCKET_BUFFER]),
        );
        let endpoint = IpListenEndpoint {
            addr: Some(IpAddress::Ipv4(Ipv4Address::from_bytes(&key.dst.ip().octets()))),
            port: key.dst.port(),
        };
        if let Err(e) = socket.listen(endpoint) {
            tracing::debug!(dst = %key.dst, error = ?e, "Failed to listen for guest connection");
            return;
        }
        let handle = self.sockets.add(socket);

        let target = SocketAddr::new(self.net.host_destination(*key.dst.ip()), key.dst.port());
        let (to_host, upload) = mpsc::channel(FLOW_QUEUE);
        let (download, from_host) = mpsc::channel(FLOW_QUEUE);
        let failed = Arc::new(AtomicBool::new(false));
        let token = self.token.child_token();
        tokio::spawn(splice(
            target,
            upload,
            download,
            failed.clone(),
            self.wake.clone(),
            token.clone(),
        ));
        tracing::debug!(guest_port = key.guest_port, dst = %key.dst, %target, "Opened TCP flow");

        self.flows.insert(
            key,
            Flow {
                handle,
                opened: Instant::now(),
                established: false,
                closed_to_guest: false,
                to_host: Some(to_host),
                from_host,
                pending: None,
                failed,
                token,
            },
        );
    }

    /// Move data between each socket and its splice task.
    fn service_flows(&mut self) {
        let mut buf = vec![0u8; CHUNK];
        for flow in self.flows.values_mut() {
            let socket = self.sockets.get_mut::<tcp::Socket>(flow.handle);
            if flow.failed.load(Ordering::Acquire) {
                socket.abort();
                continue;
            }
            if !matches!(
                socket.state(),
                tcp::State::Listen | tcp::State::SynReceived | tcp::State::Closed
            ) {
                flow.established = true;
            }

            // Host to guest.
            loop {
                if flow.pending.is_none() {
                    match flow.from_host.try_recv() {
                        Ok(data) => flow.pending = Some(Pending { data, offset: 0 }),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            if flow.established && !flow.closed_to_guest {
                                socket.close();
                                flow.closed_to_guest = true;
                            }
                            break;
                        }
                    }
                }
                let Some(pending) = flow.pending.as_mut() else {
                    break;
                };
                if !socket.can_send() {
                    break;
                }
                match socket.send_slice(&pending.data[pending.offset..]) {
                    Ok(sent) => {
                        pending.offset += sent;
                        if pending.offset == pending.data.len() {
                            flow.pending = None;
                        }
                    }
                    Err(_) => break,
                }
            }

            // Guest to host.
            while socket.can_recv() {
                let Some(to_host) = flow.to_host.as_ref() else {
                    break;
                };
                match to_host.try_reserve() {
                    Ok(permit) => match socket.recv_slice(&mut buf) {
                        Ok(len) => permit.send(buf[..len].to_vec()),
                        Err(_) => break,
                    },
                    Err(TrySendError::Full(())) => break,
                    Err(TrySendError::Closed(())) => {
                        socket.abort();
                        break;
                    }
                }
            }
            if flow.established && !socket.may_recv() {
                flow.to_host = None;
            }
        }
    }

    async fn flush(&mut self) -> bool {
        while let Some(frame) = self.device.tx.pop_front() {
            if self.out.send(frame).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Drop flows whose socket has finished.
    fn sweep(&mut self) {
        let sockets = &mut self.sockets;
        self.flows.retain(|key, flow| {
            let socket = sockets.get::<tcp::Socket>(flow.handle);
            let done = match socket.state() {
                tcp::State::Closed => true,
                tcp::State::TimeWait => !socket.can_recv(),
                tcp::State::Listen => flow.opened.elapsed() > LISTEN_TIMEOUT,
                _ => false,
            };
            if done {
                // A guest that never half-closed reset or abandoned the flow.
                if flow.to_host.is_some() {
                    flow.token.cancel();
                }
                sockets.remove(flow.handle);
                tracing::debug!(guest_port = key.guest_port, dst = %key.dst, "Closed TCP flow");
            }
            !done
        });
    }
}

/// ARP reply from the guest to the gateway, as if answering our request.
fn arp_reply(net: &NetworkConfig, guest_mac: EthernetAddress, guest_ip: Ipv4Address) -> Vec<u8> {
    let reply = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: guest_mac,
        source_protocol_addr: guest_ip,
        target_hardware_addr: net.gateway_mac,
        target_protocol_addr: Ipv4Address::from_bytes(&net.gateway_ip.octets()),
    };
    let eth = EthernetRepr {
        src_addr: guest_mac,
        dst_addr: net.gateway_mac,
        ethertype: EthernetProtocol::Arp,
    };
    let mut buf = vec![0u8; eth.buffer_len() + reply.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
    eth.emit(&mut frame);
    reply.emit(&mut ArpPacket::new_unchecked(frame.payload_mut()));
    buf
}

/// Connect to `target` and copy bytes until both directions finish.
async fn splice(
    target: SocketAddr,
    mut upload: mpsc::Receiver<Vec<u8>>,
    download: mpsc::Sender<Vec<u8>>,
    failed: Arc<AtomicBool>,
    wake: Arc<Notify>,
    token: CancellationToken,
) {
    let connected = tokio::select! {
        _ = token.cancelled() => return,
        connected = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target)) => connected,
    };
    let stream = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!(%target, error = %e, "TCP connect failed");
            failed.store(true, Ordering::Release);
            wake.notify_one();
            return;
        }
        Err(_) => {
            tracing::debug!(%target, "TCP connect timed out");
            failed.store(true, Ordering::Release);
            wake.notify_one();
            return;
        }
    };
    let (mut reader, mut writer) = stream.into_split();

    let upload_wake = wake.clone();
    let upload_half = async move {
        while let Some(chunk) = upload.recv().await {
            upload_wake.notify_one();
            if let Err(e) = writer.write_all(&chunk).await {
                tracing::debug!(%target, error = %e, "TCP write to host failed");
                return;
            }
        }
        if let Err(e) = writer.shutdown().await {
            tracing::trace!(%target, error = %e, "TCP shutdown failed");
        }
    };

    let download_wake = wake.clone();
    let download_half = async move {
        let mut buf = vec![0u8; CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(len) => {
                    if download.send(buf[..len].to_vec()).await.is_err() {
                        break;
                    }
                    download_wake.notify_one();
                }
                Err(e) => {
                    tracing::debug!(%target, error = %e, "TCP read from host failed");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = token.cancelled() => {}
        _ = async { tokio::join!(upload_half, download_half) } => {}
    }
    wake.notify_one();
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hostlink_core::config::{DaemonConfig, Profile};
    use hostlink_core::dns::ResolvConf;
    use smoltcp::phy::ChecksumCapabilities;
    use smoltcp::wire::{Ipv4Repr, TcpSeqNumber};

    fn network() -> NetworkConfig {
        NetworkConfig::new(
            &DaemonConfig::new(Profile::with_root("default", "/tmp/hostlink-tcp")),
            &ResolvConf::default(),
        )
    }

    /// Ethernet/IPv4/TCP frame from the guest carrying only a SYN.
    pub(crate) fn guest_syn(net: &NetworkConfig, guest_port: u16, dst: SocketAddrV4) -> Vec<u8> {
        let src = Ipv4Address::from_bytes(&net.guest_ip.octets());
        let dst_ip = Ipv4Address::from_bytes(&dst.ip().octets());
        let ip = Ipv4Repr {
            src_addr: src,
            dst_addr: dst_ip,
            next_header: IpProtocol::Tcp,
            payload_len: 20,
            hop_limit: 64,
        };
        let eth = EthernetRepr {
            src_addr: net.guest_mac,
            dst_addr: net.gateway_mac,
            ethertype: EthernetProtocol::Ipv4,
        };
        let mut buf = vec![0u8; eth.buffer_len() + ip.buffer_len() + ip.payload_len];
        let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
        eth.emit(&mut frame);
        let mut packet = Ipv4Packet::new_unchecked(frame.payload_mut());
        ip.emit(&mut packet, &ChecksumCapabilities::default());
        let mut segment = TcpPacket::new_unchecked(packet.payload_mut());
        segment.set_src_port(guest_port);
        segment.set_dst_port(dst.port());
        segment.set_seq_number(TcpSeqNumber(1000));
        segment.set_ack_number(TcpSeqNumber(0));
        segment.set_header_len(20);
        segment.clear_flags();
        segment.set_syn(true);
        segment.set_window_len(64_240);
        segment.set_urgent_at(0);
        segment.fill_checksum(&IpAddress::Ipv4(src), &IpAddress::Ipv4(dst_ip));
        buf
    }

    #[test]
    fn test_syn_parse() {
        let net = network();
        let dst = SocketAddrV4::new(net.nat_ip, 8080);
        let syn = Syn::parse(&guest_syn(&net, 40_000, dst)).unwrap();
        assert_eq!(syn.key, FlowKey { guest_port: 40_000, dst });
        assert_eq!(syn.src_mac, net.guest_mac);
        assert_eq!(to_std(syn.src_ip), net.guest_ip);
        assert!(Syn::parse(&arp_reply(&net, net.guest_mac, syn.src_ip)).is_none());
    }

    #[test]
    fn test_arp_reply_targets_gateway() {
        let net = network();
        let guest = Ipv4Address::from_bytes(&net.guest_ip.octets());
        let frame = arp_reply(&net, net.guest_mac, guest);
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.dst_addr(), net.gateway_mac);
        match ArpRepr::parse(&ArpPacket::new_checked(eth.payload()).unwrap()).unwrap() {
            ArpRepr::EthernetIpv4 {
                operation,
                source_protocol_addr,
                target_protocol_addr,
                ..
            } => {
                assert_eq!(operation, ArpOperation::Reply);
                assert_eq!(source_protocol_addr, guest);
                assert_eq!(to_std(target_protocol_addr), net.gateway_ip);
            }
            _ => panic!("unexpected ARP repr"),
        }
    }
}
