//! Host DNS configuration.
//!
//! Reads the host's /etc/resolv.conf so the guest network can forward
//! queries upstream and hand out the same search domains over DHCP.

use std::net::IpAddr;
use std::path::Path;

/// Default upstream servers (Google Public DNS).
const DEFAULT_DNS: &[&str] = &["8.8.8.8", "8.8.4.4"];

/// Host resolver settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    pub nameservers: Vec<IpAddr>,
    pub search: Vec<String>,
}

impl ResolvConf {
    /// Parse resolv.conf content. Comments and unknown directives are skipped;
    /// a later `search` or `domain` line replaces an earlier one.
    pub fn parse(content: &str) -> Self {
        let mut conf = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => {
                    // Scoped IPv6 servers (fe80::1%en0) are not reachable from the guest.
                    if let Some(ip) = fields.next().and_then(|s| s.parse::<IpAddr>().ok()) {
                        conf.nameservers.push(ip);
                    }
                }
                Some("search") | Some("domain") => {
                    conf.search = fields.map(|s| s.trim_end_matches('.').to_string()).collect();
                }
                _ => {}
            }
        }
        conf
    }

    /// Read a resolv.conf file. Missing or unreadable files yield the defaults.
    pub fn load(path: &Path) -> Self {
        let mut conf = match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Cannot read resolv.conf");
                Self::default()
            }
        };
        if conf.nameservers.is_empty() {
            conf.nameservers = DEFAULT_DNS.iter().filter_map(|s| s.parse().ok()).collect();
        }
        conf
    }

    /// The host's /etc/resolv.conf.
    pub fn host() -> Self {
        Self::load(Path::new("/etc/resolv.conf"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nameservers_and_search() {
        let conf = ResolvConf::parse(
            "# generated\nnameserver 1.1.1.1\nnameserver fe80::1%en0\nsearch corp.example. lan\noptions ndots:2\n",
        );
        assert_eq!(conf.nameservers, vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(conf.search, vec!["corp.example", "lan"]);
    }

    #[test]
    fn test_domain_replaces_search() {
        let conf = ResolvConf::parse("search a b\ndomain c\n");
        assert_eq!(conf.search, vec!["c"]);
    }

    #[test]
    fn test_load_missing_uses_defaults() {
        let conf = ResolvConf::load(Path::new("/nonexistent/resolv.conf"));
        assert_eq!(conf.nameservers.len(), 2);
        assert!(conf.search.is_empty());
    }

    #[test]
    fn test_load_without_nameservers_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "search home\n").unwrap();
        let conf = ResolvConf::load(&path);
        assert_eq!(conf.nameservers[0], "8.8.8.8".parse::<IpAddr>().unwrap());
        assert_eq!(conf.search, vec!["home"]);
    }
}
