//! Ethernet switch between the guest NIC and the host.
//!
//! The gateway answers ARP, DHCP and DNS itself; other guest UDP traffic is
//! relayed through host sockets by [`UdpNat`], and guest TCP is terminated
//! by [`TcpStack`].

use hostlink_core::error::{HostlinkError, Result};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::dhcp;
use super::dns::{self, Resolver};
use super::nat::UdpNat;
use super::network::{NetworkConfig, SUBNET};
use super::tcp::TcpStack;

const HOP_LIMIT: u8 = 64;

fn wire_error(e: smoltcp::wire::Error) -> HostlinkError {
    HostlinkError::ProtocolError(format!("malformed frame: {e}"))
}

fn to_std(addr: Ipv4Address) -> Ipv4Addr {
    Ipv4Addr::from(addr.0)
}

fn to_wire(addr: Ipv4Addr) -> Ipv4Address {
    Ipv4Address::from_bytes(&addr.octets())
}

/// Encode an Ethernet/IPv4/UDP frame.
pub fn udp_frame(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
) -> Vec<u8> {
    let caps = ChecksumCapabilities::default();
    let udp = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    let ip = Ipv4Repr {
        src_addr: to_wire(*src.ip()),
        dst_addr: to_wire(*dst.ip()),
        next_header: IpProtocol::Udp,
        payload_len: udp.header_len() + payload.len(),
        hop_limit: HOP_LIMIT,
    };
    let eth = EthernetRepr {
        src_addr: src_mac,
        dst_addr: dst_mac,
        ethertype: EthernetProtocol::Ipv4,
    };

    let mut buf = vec![0u8; eth.buffer_len() + ip.buffer_len() + ip.payload_len];
    let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
    eth.emit(&mut frame);
    let mut packet = Ipv4Packet::new_unchecked(frame.payload_mut());
    ip.emit(&mut packet, &caps);
    let mut datagram = UdpPacket::new_unchecked(packet.payload_mut());
    udp.emit(
        &mut datagram,
        &IpAddress::Ipv4(ip.src_addr),
        &IpAddress::Ipv4(ip.dst_addr),
        payload.len(),
        |b| b.copy_from_slice(payload),
        &caps,
    );
    buf
}

/// Frame from the gateway to the guest.
pub fn to_guest(net: &NetworkConfig, src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    udp_frame(net.gateway_mac, net.guest_mac, src, dst, payload)
}

pub struct Switch {
    net: Arc<NetworkConfig>,
    resolver: Arc<Resolver>,
    nat: UdpNat,
    tcp: TcpStack,
    out: mpsc::Sender<Vec<u8>>,
}

impl Switch {
    /// Frames for the guest are sent on `out`. NAT flows and the TCP stack
    /// end with `token`.
    pub fn new(net: NetworkConfig, out: mpsc::Sender<Vec<u8>>, token: CancellationToken) -> Self {
        let net = Arc::new(net);
        let resolver = Arc::new(Resolver::new(net.zones.clone(), net.upstream));
        let nat = UdpNat::new(net.clone(), out.clone(), token.clone());
        let tcp = TcpStack::spawn(net.clone(), out.clone(), token);
        Self {
            net,
            resolver,
            nat,
            tcp,
            out,
        }
    }

    pub fn nat(&self) -> &UdpNat {
        &self.nat
    }

    /// Process one frame from the guest.
    pub async fn handle(&self, bytes: &[u8]) -> Result<()> {
        let frame = EthernetFrame::new_checked(bytes).map_err(wire_error)?;
        let dst = frame.dst_addr();
        if dst != self.net.gateway_mac && !dst.is_broadcast() {
            return Ok(());
        }
        match frame.ethertype() {
            EthernetProtocol::Arp => self.handle_arp(bytes, frame.payload()).await,
            EthernetProtocol::Ipv4 => self.handle_ipv4(bytes, frame.payload()).await,
            other => {
                tracing::trace!(ethertype = %other, "Dropping frame");
                Ok(())
            }
        }
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.out
            .send(frame)
            .await
            .map_err(|_| HostlinkError::NetworkError("guest connection closed".to_string()))
    }

    async fn handle_arp(&self, bytes: &[u8], payload: &[u8]) -> Result<()> {
        let packet = ArpPacket::new_checked(payload).map_err(wire_error)?;
        let repr = ArpRepr::parse(&packet).map_err(wire_error)?;
        let ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_protocol_addr,
            ..
        } = repr
        else {
            return Ok(());
        };

        // Replies to the TCP stack's own ARP requests.
        if operation == ArpOperation::Reply {
            if to_std(target_protocol_addr) == self.net.gateway_ip {
                self.tcp.deliver(bytes.to_vec()).await?;
            }
            return Ok(());
        }
        if operation != ArpOperation::Request {
            return Ok(());
        }

        let target = to_std(target_protocol_addr);
        if target != self.net.gateway_ip && target != self.net.nat_ip {
            return Ok(());
        }

        let reply = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr: self.net.gateway_mac,
            source_protocol_addr: target_protocol_addr,
            target_hardware_addr: source_hardware_addr,
            target_protocol_addr: source_protocol_addr,
        };
        let eth = EthernetRepr {
            src_addr: self.net.gateway_mac,
            dst_addr: source_hardware_addr,
            ethertype: EthernetProtocol::Arp,
        };
        let mut buf = vec![0u8; eth.buffer_len() + reply.buffer_len()];
        let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
        eth.emit(&mut frame);
        reply.emit(&mut ArpPacket::new_unchecked(frame.payload_mut()));
        self.send(buf).await
    }

    async fn handle_ipv4(&self, bytes: &[u8], payload: &[u8]) -> Result<()> {
        let packet = Ipv4Packet::new_checked(payload).map_err(wire_error)?;
        let ip = Ipv4Repr::parse(&packet, &ChecksumCapabilities::ignored()).map_err(wire_error)?;
        match ip.next_header {
            IpProtocol::Udp => {}
            IpProtocol::Tcp => {
                let dst = to_std(ip.dst_addr);
                if self.is_local(dst) && dst != self.net.nat_ip {
                    tracing::trace!(%dst, "Dropping TCP to unknown local address");
                    return Ok(());
                }
                return self.tcp.deliver(bytes.to_vec()).await;
            }
            other => {
                tracing::trace!(protocol = %other, dst = %ip.dst_addr, "Dropping IPv4 packet");
                return Ok(());
            }
        }

        let datagram = UdpPacket::new_checked(packet.payload()).map_err(wire_error)?;
        let udp = UdpRepr::parse(
            &datagram,
            &IpAddress::Ipv4(ip.src_addr),
            &IpAddress::Ipv4(ip.dst_addr),
            &ChecksumCapabilities::ignored(),
        )
        .map_err(wire_error)?;
        let body = datagram.payload();

        let src = SocketAddrV4::new(to_std(ip.src_addr), udp.src_port);
        let dst = SocketAddrV4::new(to_std(ip.dst_addr), udp.dst_port);

        if udp.dst_port == dhcp::SERVER_PORT && udp.src_port == dhcp::CLIENT_PORT {
            if let Some(reply) = dhcp::handle(body, &self.net) {
                let from = SocketAddrV4::new(self.net.gateway_ip, dhcp::SERVER_PORT);
                let to = SocketAddrV4::new(Ipv4Addr::BROADCAST, dhcp::CLIENT_PORT);
                self.send(to_guest(&self.net, from, to, &reply)).await?;
            }
            return Ok(());
        }

        if *dst.ip() == self.net.gateway_ip {
            if udp.dst_port == dns::PORT {
                self.spawn_dns(src, dst, body.to_vec());
            }
            return Ok(());
        }

        if self.is_local(*dst.ip()) && *dst.ip() != self.net.nat_ip {
            tracing::trace!(%dst, "Dropping UDP to unknown local address");
            return Ok(());
        }

        self.nat.send(src.port(), dst, body).await
    }

    /// Resolve off the frame loop so a slow upstream does not stall the guest.
    fn spawn_dns(&self, guest: SocketAddrV4, gateway: SocketAddrV4, query: Vec<u8>) {
        let resolver = self.resolver.clone();
        let net = self.net.clone();
        let out = self.out.clone();
        tokio::spawn(async move {
            if let Some(answer) = resolver.answer(&query).await {
                let _ = out.send(to_guest(&net, gateway, guest, &answer)).await;
            }
        });
    }

    fn is_local(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.net.netmask);
        (u32::from(ip) & mask) == u32::from(SUBNET) || ip.is_broadcast()
    }
}
