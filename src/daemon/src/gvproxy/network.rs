//! Addressing of the user-space guest network.

use hostlink_core::config::DaemonConfig;
use hostlink_core::dns::ResolvConf;
use sha2::{Digest, Sha256};
use smoltcp::wire::EthernetAddress;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use super::zones::{extract_zones, Zone};

pub const SUBNET: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 0);
pub const PREFIX_LEN: u8 = 24;
pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 2);
/// Virtual address the guest uses to reach the host's loopback.
pub const NAT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 254);
pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 15);
pub const MTU: u16 = 1500;
pub const GATEWAY_MAC: [u8; 6] = [0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xdd];
pub const LEASE_SECS: u32 = 3600;

pub const HOST_ALIAS: &str = "host.hostlink.internal";
pub const GATEWAY_ALIAS: &str = "gateway.hostlink.internal";

/// Guest MAC for a profile: fixed prefix plus the low bytes of a hash of its directory.
pub fn guest_mac(profile_dir: &Path) -> EthernetAddress {
    let digest = Sha256::digest(profile_dir.to_string_lossy().as_bytes());
    let tail = &digest[digest.len() - 3..];
    tracing::trace!(profile = %profile_dir.display(), suffix = %hex::encode(tail), "Derived guest MAC");
    EthernetAddress([0x5a, 0x94, 0xef, tail[0], tail[1], tail[2]])
}

/// Built-in names merged under the user's DNS hosts.
pub fn default_hosts() -> HashMap<String, String> {
    HashMap::from([
        (HOST_ALIAS.to_string(), NAT_IP.to_string()),
        (GATEWAY_ALIAS.to_string(), GATEWAY_IP.to_string()),
    ])
}

pub fn netmask() -> Ipv4Addr {
    Ipv4Addr::from(u32::MAX << (32 - PREFIX_LEN as u32))
}

/// Everything the packet switch needs to know about the network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: EthernetAddress,
    pub nat_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub guest_mac: EthernetAddress,
    pub netmask: Ipv4Addr,
    pub mtu: u16,
    pub lease_secs: u32,
    pub search_domains: Vec<String>,
    pub zones: Vec<Zone>,
    /// Upstream resolver for names outside the synthesized zones.
    pub upstream: Option<SocketAddr>,
}

impl NetworkConfig {
    /// Network for a daemon, using the host's resolver settings.
    pub fn for_daemon(config: &DaemonConfig) -> Self {
        Self::new(config, &ResolvConf::host())
    }

    pub fn new(config: &DaemonConfig, resolv: &ResolvConf) -> Self {
        let mut hosts = default_hosts();
        hosts.extend(config.dns_hosts.clone());

        // Queries are forwarded from the host, so a loopback resolver is fine.
        let upstream = resolv
            .nameservers
            .first()
            .map(|ip| SocketAddr::new(*ip, 53));

        Self {
            gateway_ip: GATEWAY_IP,
            gateway_mac: EthernetAddress(GATEWAY_MAC),
            nat_ip: NAT_IP,
            guest_ip: GUEST_IP,
            guest_mac: guest_mac(&config.profile.dir()),
            netmask: netmask(),
            mtu: MTU,
            lease_secs: LEASE_SECS,
            search_domains: resolv.search.clone(),
            zones: extract_zones(&hosts),
            upstream,
        }
    }

    /// Host-side address for a guest destination; the NAT IP maps to loopback.
    pub fn host_destination(&self, ip: Ipv4Addr) -> IpAddr {
        if ip == self.nat_ip {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(ip)
        }
    }
}
