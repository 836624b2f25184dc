//! Minimal DHCPv4 server handing out a single static lease.

use hostlink_core::error::{HostlinkError, Result};
use std::net::Ipv4Addr;

use super::network::NetworkConfig;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const HEADER_LEN: usize = 240;
const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_MTU: u8 = 26;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_DOMAIN_SEARCH: u8 = 119;
const OPT_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }
}

/// The fields of a DHCP message the server cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: u8,
    pub xid: u32,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub chaddr: [u8; 6],
    pub message_type: Option<MessageType>,
    pub requested_ip: Option<Ipv4Addr>,
    pub server_id: Option<Ipv4Addr>,
}

fn ipv4_at(buf: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[at], buf[at + 1], buf[at + 2], buf[at + 3])
}

fn option_ipv4(value: &[u8]) -> Option<Ipv4Addr> {
    (value.len() == 4).then(|| ipv4_at(value, 0))
}

impl DhcpMessage {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN || buf[236..240] != MAGIC_COOKIE {
            return Err(HostlinkError::ProtocolError("not a DHCP message".to_string()));
        }
        let mut chaddr = [0u8; 6];
        chaddr.copy_from_slice(&buf[28..34]);

        let mut message = Self {
            op: buf[0],
            xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            flags: u16::from_be_bytes([buf[10], buf[11]]),
            ciaddr: ipv4_at(buf, 12),
            yiaddr: ipv4_at(buf, 16),
            chaddr,
            message_type: None,
            requested_ip: None,
            server_id: None,
        };

        let mut options = &buf[HEADER_LEN..];
        while let Some((&code, rest)) = options.split_first() {
            match code {
                OPT_PAD => {
                    options = rest;
                    continue;
                }
                OPT_END => break,
                _ => {}
            }
            let (&len, rest) = rest
                .split_first()
                .ok_or_else(|| HostlinkError::ProtocolError("truncated DHCP option".to_string()))?;
            let len = len as usize;
            if rest.len() < len {
                return Err(HostlinkError::ProtocolError("truncated DHCP option".to_string()));
            }
            let value = &rest[..len];
            match code {
                OPT_MESSAGE_TYPE => message.message_type = value.first().copied().and_then(MessageType::from_u8),
                OPT_REQUESTED_IP => message.requested_ip = option_ipv4(value),
                OPT_SERVER_ID => message.server_id = option_ipv4(value),
                _ => {}
            }
            options = &rest[len..];
        }
        Ok(message)
    }

    /// Encode as a BOOTREQUEST with the given type. Used by tests and health checks.
    pub fn request(xid: u32, chaddr: [u8; 6], message_type: MessageType, requested_ip: Option<Ipv4Addr>) -> Vec<u8> {
        let mut buf = header(BOOTREQUEST, xid, 0x8000, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, chaddr);
        push_option(&mut buf, OPT_MESSAGE_TYPE, &[message_type as u8]);
        if let Some(ip) = requested_ip {
            push_option(&mut buf, OPT_REQUESTED_IP, &ip.octets());
        }
        buf.push(OPT_END);
        buf
    }
}

fn header(op: u8, xid: u32, flags: u16, yiaddr: Ipv4Addr, siaddr: Ipv4Addr, chaddr: [u8; 6]) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN];
    buf[0] = op;
    buf[1] = 1; // Ethernet
    buf[2] = 6;
    buf[4..8].copy_from_slice(&xid.to_be_bytes());
    buf[10..12].copy_from_slice(&flags.to_be_bytes());
    buf[16..20].copy_from_slice(&yiaddr.octets());
    buf[20..24].copy_from_slice(&siaddr.octets());
    buf[28..34].copy_from_slice(&chaddr);
    buf[236..240].copy_from_slice(&MAGIC_COOKIE);
    buf
}

/// Append an option, splitting values over 255 bytes into consecutive instances.
fn push_option(buf: &mut Vec<u8>, code: u8, value: &[u8]) {
    for chunk in value.chunks(255) {
        buf.push(code);
        buf.push(chunk.len() as u8);
        buf.extend_from_slice(chunk);
    }
}

/// Domain search list in DNS wire format, without compression.
pub fn encode_search_list(domains: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for domain in domains {
        for label in domain.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
            let label = &label.as_bytes()[..label.len().min(63)];
            out.push(label.len() as u8);
            out.extend_from_slice(label);
        }
        out.push(0);
    }
    out
}

fn reply(request: &DhcpMessage, kind: MessageType, net: &NetworkConfig) -> Vec<u8> {
    let yiaddr = if kind == MessageType::Nak {
        Ipv4Addr::UNSPECIFIED
    } else {
        net.guest_ip
    };
    let mut buf = header(BOOTREPLY, request.xid, request.flags, yiaddr, net.gateway_ip, request.chaddr);
    push_option(&mut buf, OPT_MESSAGE_TYPE, &[kind as u8]);
    push_option(&mut buf, OPT_SERVER_ID, &net.gateway_ip.octets());
    if kind != MessageType::Nak {
        push_option(&mut buf, OPT_LEASE_TIME, &net.lease_secs.to_be_bytes());
        push_option(&mut buf, OPT_SUBNET_MASK, &net.netmask.octets());
        push_option(&mut buf, OPT_ROUTER, &net.gateway_ip.octets());
        push_option(&mut buf, OPT_DNS, &net.gateway_ip.octets());
        push_option(&mut buf, OPT_MTU, &net.mtu.to_be_bytes());
        if !net.search_domains.is_empty() {
            push_option(&mut buf, OPT_DOMAIN_SEARCH, &encode_search_list(&net.search_domains));
        }
    }
    buf.push(OPT_END);
    buf
}

/// Answer a client message. Returns the reply payload, or `None` when the
/// message is ignored (foreign MAC, not a request, or an unhandled type).
pub fn handle(payload: &[u8], net: &NetworkConfig) -> Option<Vec<u8>> {
    let message = match DhcpMessage::parse(payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(error = %e, "Dropping malformed DHCP packet");
            return None;
        }
    };
    if message.op != BOOTREQUEST {
        return None;
    }
    if message.chaddr != net.guest_mac.0 {
        tracing::debug!(mac = ?message.chaddr, "Ignoring DHCP from unknown MAC");
        return None;
    }

    match message.message_type? {
        MessageType::Discover => {
            tracing::debug!(xid = message.xid, ip = %net.guest_ip, "DHCP offer");
            Some(reply(&message, MessageType::Offer, net))
        }
        MessageType::Request => {
            if message.server_id.is_some_and(|id| id != net.gateway_ip) {
                // The client picked another server.
                return None;
            }
            let wanted = message
                .requested_ip
                .filter(|ip| !ip.is_unspecified())
                .unwrap_or(message.ciaddr);
            if wanted.is_unspecified() || wanted == net.guest_ip {
                tracing::debug!(xid = message.xid, ip = %net.guest_ip, "DHCP ack");
                Some(reply(&message, MessageType::Ack, net))
            } else {
                tracing::debug!(xid = message.xid, requested = %wanted, "DHCP nak");
                Some(reply(&message, MessageType::Nak, net))
            }
        }
        _ => None,
    }
}
