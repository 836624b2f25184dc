//! DNS server on the gateway: answers from synthesized zones, forwards the rest.

use hostlink_core::error::{HostlinkError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

use super::zones::Zone;

pub const PORT: u16 = 53;

const HEADER_LEN: usize = 12;
const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;
const ANSWER_TTL: u32 = 60;
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;

/// First question of a DNS query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id: u16,
    pub flags: u16,
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Byte offset just past the question section.
    question_end: usize,
}

impl Query {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(malformed("short header"));
        }
        let id = u16::from_be_bytes([buf[0], buf[1]]);
        let flags = u16::from_be_bytes([buf[2], buf[3]]);
        let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
        if flags & 0x8000 != 0 || qdcount == 0 {
            return Err(malformed("not a query"));
        }

        let mut labels = Vec::new();
        let mut at = HEADER_LEN;
        loop {
            let len = *buf.get(at).ok_or_else(|| malformed("truncated name"))? as usize;
            at += 1;
            if len == 0 {
                break;
            }
            if len > 63 {
                return Err(malformed("compressed or oversized label in question"));
            }
            let label = buf.get(at..at + len).ok_or_else(|| malformed("truncated label"))?;
            labels.push(String::from_utf8_lossy(label).to_string());
            at += len;
        }
        let tail = buf.get(at..at + 4).ok_or_else(|| malformed("truncated question"))?;

        Ok(Self {
            id,
            flags,
            name: labels.join("."),
            qtype: u16::from_be_bytes([tail[0], tail[1]]),
            qclass: u16::from_be_bytes([tail[2], tail[3]]),
            question_end: at + 4,
        })
    }

    /// Build a response echoing the question, with `answers` as A records.
    pub fn response(&self, query: &[u8], rcode: u8, answers: &[Ipv4Addr]) -> Vec<u8> {
        let opcode_rd = self.flags & 0x7900;
        let flags = 0x8000 | opcode_rd | 0x0080 | u16::from(rcode & 0x0f);

        let mut out = Vec::with_capacity(self.question_end + answers.len() * 16);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&(answers.len() as u16).to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(&query[HEADER_LEN..self.question_end]);
        for ip in answers {
            out.extend_from_slice(&[0xc0, HEADER_LEN as u8]);
            out.extend_from_slice(&TYPE_A.to_be_bytes());
            out.extend_from_slice(&CLASS_IN.to_be_bytes());
            out.extend_from_slice(&ANSWER_TTL.to_be_bytes());
            out.extend_from_slice(&4u16.to_be_bytes());
            out.extend_from_slice(&ip.octets());
        }
        out
    }
}

fn malformed(what: &str) -> HostlinkError {
    HostlinkError::ProtocolError(format!("malformed DNS query: {what}"))
}

/// Encode a single-question query. Used by tests and health checks.
pub fn encode_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes());
    out.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
    for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out
}

/// Result of a local zone lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found(IpAddr),
    NotLocal,
}

/// Resolves guest queries from synthesized zones and an upstream server.
#[derive(Debug, Clone)]
pub struct Resolver {
    zones: Vec<Zone>,
    upstream: Option<SocketAddr>,
}

impl Resolver {
    pub fn new(zones: Vec<Zone>, upstream: Option<SocketAddr>) -> Self {
        Self { zones, upstream }
    }

    /// Look a name up in the zones: exact record match first, then the
    /// zone's default IP. Matching is case-insensitive.
    pub fn lookup(&self, name: &str) -> Lookup {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        for zone in &self.zones {
            let zone_name = zone.name.trim_end_matches('.').to_ascii_lowercase();
            let record = if name == zone_name {
                Some("")
            } else {
                name.strip_suffix(&zone_name)
                    .and_then(|prefix| prefix.strip_suffix('.'))
            };
            let Some(record) = record else { continue };

            if let Some(found) = zone
                .records
                .iter()
                .find(|r| !record.is_empty() && r.name.eq_ignore_ascii_case(record))
            {
                return Lookup::Found(found.ip);
            }
            if let Some(ip) = zone.default_ip {
                return Lookup::Found(ip);
            }
        }
        Lookup::NotLocal
    }

    /// Answer a raw query. Returns `None` for packets that are not queries.
    pub async fn answer(&self, query: &[u8]) -> Option<Vec<u8>> {
        let parsed = match Query::parse(query) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping DNS packet");
                return None;
            }
        };

        if parsed.qclass == CLASS_IN {
            if let Lookup::Found(ip) = self.lookup(&parsed.name) {
                let answers: Vec<Ipv4Addr> = match (parsed.qtype, ip) {
                    (TYPE_A, IpAddr::V4(v4)) => vec![v4],
                    _ => Vec::new(),
                };
                tracing::trace!(name = %parsed.name, %ip, "DNS answered from zone");
                return Some(parsed.response(query, RCODE_NOERROR, &answers));
            }
        }

        let Some(upstream) = self.upstream else {
            return Some(parsed.response(query, RCODE_NXDOMAIN, &[]));
        };
        match forward(query, upstream).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                tracing::debug!(name = %parsed.name, %upstream, error = %e, "DNS forward failed");
                Some(parsed.response(query, RCODE_SERVFAIL, &[]))
            }
        }
    }
}

async fn forward(query: &[u8], upstream: SocketAddr) -> Result<Vec<u8>> {
    let bind: SocketAddr = match upstream {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(upstream).await?;
    socket.send(query).await?;

    let mut buf = vec![0u8; 4096];
    let len = tokio::time::timeout(FORWARD_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| HostlinkError::TimeoutError(format!("DNS upstream {upstream}")))??;
    buf.truncate(len);
    Ok(buf)
}
