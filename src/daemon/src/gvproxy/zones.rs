//! DNS zones synthesized from a flat host → IP/alias map.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

/// A single name inside a zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub ip: IpAddr,
}

/// Names sharing a suffix. `default_ip` answers for the zone apex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    /// Fully qualified, with a trailing dot (`com.`), or a bare single label.
    pub name: String,
    pub default_ip: Option<IpAddr>,
    pub records: Vec<Record>,
}

/// Resolve `host` to an IP by following alias values through `hosts`.
///
/// Gives up after `hosts.len() + 1` hops, so cyclic aliases resolve to `None`.
pub fn host_ip(hosts: &HashMap<String, String>, host: &str) -> Option<IpAddr> {
    let mut current = host;
    for _ in 0..=hosts.len() {
        let value = hosts.get(current).map(String::as_str).filter(|v| !v.is_empty())?;
        if let Ok(ip) = value.parse::<IpAddr>() {
            return Some(ip);
        }
        current = value;
    }
    None
}

/// Split a host into `(zone, record)` on its last dot.
pub fn zone_host(host: &str) -> (String, String) {
    match host.rfind('.') {
        Some(i) => (format!("{}.", &host[i + 1..]), host[..i].to_string()),
        None => (host.to_string(), String::new()),
    }
}

/// Group every resolvable host into zones, ordered by zone name.
pub fn extract_zones(hosts: &HashMap<String, String>) -> Vec<Zone> {
    let mut names: Vec<&String> = hosts.keys().collect();
    names.sort();

    let mut zones: BTreeMap<String, Zone> = BTreeMap::new();
    for host in names {
        let Some(ip) = host_ip(hosts, host) else {
            tracing::debug!(host = %host, "Skipping DNS host without a resolvable IP");
            continue;
        };
        let (zone_name, record) = zone_host(host);
        let zone = zones.entry(zone_name.clone()).or_insert_with(|| Zone {
            name: zone_name,
            default_ip: None,
            records: Vec::new(),
        });
        if record.is_empty() {
            zone.default_ip.get_or_insert(ip);
        } else {
            zone.records.push(Record { name: record, ip });
        }
    }
    zones.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_host_ip_direct() {
        let map = hosts(&[("a", "10.0.0.1")]);
        assert_eq!(host_ip(&map, "a"), Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_host_ip_alias_chain() {
        let map = hosts(&[("a", "b"), ("b", "c"), ("c", "192.168.5.2")]);
        assert_eq!(host_ip(&map, "a"), Some("192.168.5.2".parse().unwrap()));
    }

    #[test]
    fn test_host_ip_missing_or_empty() {
        let map = hosts(&[("a", ""), ("b", "nowhere")]);
        assert_eq!(host_ip(&map, "a"), None);
        assert_eq!(host_ip(&map, "b"), None);
        assert_eq!(host_ip(&map, "zzz"), None);
    }

    #[test]
    fn test_host_ip_cycle() {
        let map = hosts(&[("a", "b"), ("b", "a")]);
        assert_eq!(host_ip(&map, "a"), None);

        let map = hosts(&[("self", "self")]);
        assert_eq!(host_ip(&map, "self"), None);
    }

    #[test]
    fn test_zone_host() {
        assert_eq!(zone_host("google.com"), ("com.".to_string(), "google".to_string()));
        assert_eq!(
            zone_host("local.google.com"),
            ("com.".to_string(), "local.google".to_string())
        );
        assert_eq!(zone_host("localhost"), ("localhost".to_string(), String::new()));
    }

    #[test]
    fn test_extract_zones() {
        let map = hosts(&[
            ("google.com", "8.8.4.4"),
            ("local.google.com", "8.8.8.8"),
            ("localhost", "127.0.0.1"),
        ]);
        let zones = extract_zones(&map);
        assert_eq!(
            zones,
            vec![
                Zone {
                    name: "com.".to_string(),
                    default_ip: None,
                    records: vec![
                        Record {
                            name: "google".to_string(),
                            ip: "8.8.4.4".parse().unwrap(),
                        },
                        Record {
                            name: "local.google".to_string(),
                            ip: "8.8.8.8".parse().unwrap(),
                        },
                    ],
                },
                Zone {
                    name: "localhost".to_string(),
                    default_ip: Some("127.0.0.1".parse().unwrap()),
                    records: Vec::new(),
                },
            ]
        );
    }

    #[test]
    fn test_extract_zones_skips_unresolvable() {
        let map = hosts(&[("a.test", "b.test"), ("b.test", "a.test"), ("c.test", "10.0.0.3")]);
        let zones = extract_zones(&map);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].records.len(), 1);
        assert_eq!(zones[0].records[0].name, "c");
    }
}
