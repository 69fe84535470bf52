//! Host restriction matching: single IPs, CIDR networks, hostnames and
//! `*`-prefixed hostname wildcards.
//!
//! Matching is deliberately asymmetric between entry kinds:
//! - an IP is compared to a hostname through reverse lookup of the IP, and
//!   wildcards are honoured;
//! - a hostname is compared to an IP through reverse lookup as well, but a
//!   wildcard hostname never matches an IP;
//! - a network is never contained in a single IP, and never matches a
//!   hostname.

use std::collections::HashMap;
use std::net::IpAddr;

/// Reverse DNS, injected so matching stays deterministic under test.
pub trait HostResolver {
    /// Primary hostname of `ip`, if any.
    fn reverse_lookup(&self, ip: IpAddr) -> Option<String>;
}

/// Resolves nothing. Hostname entries then only match other hostnames.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResolver;

impl HostResolver for NoResolver {
    fn reverse_lookup(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Fixed IP → hostname table.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    names: HashMap<IpAddr, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: IpAddr, host: impl Into<String>) -> Self {
        self.names.insert(ip, host.into());
        self
    }
}

impl HostResolver for StaticResolver {
    fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        self.names.get(&ip).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostEntry {
    Ip(IpAddr),
    Net { addr: IpAddr, prefix: u8 },
    Name(String),
}

impl HostEntry {
    fn parse(s: &str) -> Self {
        if let Some((addr, prefix)) = s.split_once('/') {
            if let (Ok(addr), Ok(prefix)) = (addr.parse::<IpAddr>(), prefix.parse::<u8>()) {
                if prefix <= max_prefix(addr) && !addr.is_unspecified() {
                    // host bits set: "10.0.0.5/24" names the single address
                    if network_addr(addr, prefix) == addr {
                        return HostEntry::Net { addr, prefix };
                    }
                    return HostEntry::Ip(addr);
                }
            }
            return HostEntry::Name(s.to_string());
        }
        match s.parse::<IpAddr>() {
            Ok(ip) if !ip.is_unspecified() => HostEntry::Ip(ip),
            _ => HostEntry::Name(s.to_string()),
        }
    }
}

fn max_prefix(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn network_addr(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
            IpAddr::V4((u32::from(v4) & mask).into())
        }
        IpAddr::V6(v6) => {
            let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
            IpAddr::V6((u128::from(v6) & mask).into())
        }
    }
}

fn net_contains(net: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    let same_family = matches!(
        (net, ip),
        (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
    );
    same_family && network_addr(ip, prefix) == net
}

fn with_trailing_dot(s: &str) -> String {
    if s.is_empty() || s.ends_with('.') {
        s.to_string()
    } else {
        format!("{s}.")
    }
}

fn ip_to_ip(a: &HostEntry, b: &HostEntry) -> bool {
    match (a, b) {
        (HostEntry::Ip(a), HostEntry::Ip(b)) => a == b,
        (HostEntry::Ip(a), HostEntry::Net { addr, prefix }) => net_contains(*addr, *prefix, *a),
        (
            HostEntry::Net {
                addr: a_addr,
                prefix: a_prefix,
            },
            HostEntry::Net { addr, prefix },
        ) => net_contains(*addr, *prefix, *a_addr) && a_prefix >= prefix,
        _ => false,
    }
}

fn ip_to_host(ip: IpAddr, host: &str, resolver: &dyn HostResolver) -> bool {
    let Some(ip_host) = resolver.reverse_lookup(ip).filter(|h| !h.is_empty()) else {
        return false;
    };
    let host = if ip_host.ends_with('.') {
        with_trailing_dot(host)
    } else {
        host.to_string()
    };
    match host.strip_prefix('*') {
        Some(suffix) if !suffix.is_empty() => ip_host.ends_with(suffix),
        _ => ip_host == host,
    }
}

fn host_to_ip(host: &str, ip: IpAddr, resolver: &dyn HostResolver) -> bool {
    if host.len() > 1 && host.starts_with('*') {
        return false;
    }
    let Some(ip_host) = resolver.reverse_lookup(ip) else {
        return false;
    };
    with_trailing_dot(host) == with_trailing_dot(&ip_host)
}

fn host_to_host(a: &str, b: &str) -> bool {
    let a = with_trailing_dot(a);
    let b = with_trailing_dot(b);
    if a == b {
        return true;
    }
    let b_wild = b.len() > 1 && b.starts_with('*');
    if a.len() > 1 && a.starts_with('*') {
        return b_wild && a[1..].ends_with(&b[1..]);
    }
    b_wild && a.ends_with(&b[1..])
}

/// Whether host entry `a` is covered by host entry `b`.
pub fn entry_within(a: &str, b: &str, resolver: &dyn HostResolver) -> bool {
    let ea = HostEntry::parse(a);
    let eb = HostEntry::parse(b);
    match (&ea, &eb) {
        (HostEntry::Name(a), HostEntry::Name(b)) => host_to_host(a, b),
        (HostEntry::Name(a), HostEntry::Ip(ip)) => host_to_ip(a, *ip, resolver),
        (HostEntry::Name(_), HostEntry::Net { .. }) => false,
        (HostEntry::Ip(ip), HostEntry::Name(b)) => ip_to_host(*ip, b, resolver),
        (HostEntry::Net { .. }, HostEntry::Name(_)) => false,
        _ => ip_to_ip(&ea, &eb),
    }
}

/// Whether `client` is allowed by any entry of `hosts`.
pub fn ip_allowed(client: IpAddr, hosts: &[String], resolver: &dyn HostResolver) -> bool {
    let client = client.to_string();
    hosts.iter().any(|h| entry_within(&client, h, resolver))
}

/// Whether every entry of `a` is covered by some entry of `b`.
pub fn hosts_within(a: &[String], b: &[String], resolver: &dyn HostResolver) -> bool {
    a.iter()
        .all(|ea| b.iter().any(|eb| entry_within(ea, eb, resolver)))
}
