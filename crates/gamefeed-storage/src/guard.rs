//! Private-network guard for outbound fetches of untrusted URLs.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use tracing::debug;
use url::{Host, Url};

/// Decides whether an outbound request to `uri` must be refused.
pub trait TargetGuard: Send + Sync {
    fn is_unsafe(&self, uri: &str) -> bool;
}

/// Resolves the URI's host with the system resolver and flags non-public addresses.
///
/// Resolver errors are fail-open unless `fail_closed` is set. The check is not
/// pinned to the address later used for the connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivateNetworkGuard {
    pub fail_closed: bool,
}

impl PrivateNetworkGuard {
    pub fn new(fail_closed: bool) -> Self {
        Self { fail_closed }
    }
}

impl TargetGuard for PrivateNetworkGuard {
    fn is_unsafe(&self, uri: &str) -> bool {
        let Ok(parsed) = Url::parse(uri) else {
            return false;
        };
        let Some(host) = parsed.host() else {
            return false;
        };

        match host {
            Host::Ipv4(v4) => is_non_public_ip(IpAddr::V4(v4)),
            Host::Ipv6(v6) => is_non_public_ip(IpAddr::V6(v6)),
            Host::Domain(name) => {
                let port = parsed.port_or_known_default().unwrap_or(80);
                match (name, port).to_socket_addrs() {
                    Ok(addrs) => {
                        let addrs = addrs.collect::<Vec<_>>();
                        if addrs.is_empty() {
                            return self.fail_closed;
                        }
                        addrs.iter().any(|addr| is_non_public_ip(addr.ip()))
                    }
                    Err(err) => {
                        debug!(host = name, error = %err, "host resolution failed");
                        self.fail_closed
                    }
                }
            }
        }
    }
}

/// Fail-open check with the default guard.
pub fn is_unsafe_target(uri: &str) -> bool {
    PrivateNetworkGuard::default().is_unsafe(uri)
}

pub fn is_non_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_non_public_v4(v4),
        IpAddr::V6(v6) => is_non_public_v6(v6),
    }
}

fn is_non_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || a == 0
        // shared address space
        || (a == 100 && (64..=127).contains(&b))
        // IETF protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // benchmarking
        || (a == 198 && (b & 0xfe) == 18)
        || a >= 240
}

fn is_non_public_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_non_public_v4(v4);
    }
    let seg = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // unique local fc00::/7
        || (seg[0] & 0xfe00) == 0xfc00
        // link local fe80::/10
        || (seg[0] & 0xffc0) == 0xfe80
        // documentation 2001:db8::/32
        || (seg[0] == 0x2001 && seg[1] == 0x0db8)
}
