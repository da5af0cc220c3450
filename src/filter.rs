use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Which addresses stay visible. Applied before anything is aggregated,
/// so a hidden address never shows up as a node, an edge endpoint, a
/// buffered packet or an alert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilityPolicy {
    pub ipv4_only: bool,
    pub private_only: bool,
}

impl VisibilityPolicy {
    pub fn hides(&self, ip: IpAddr) -> bool {
        should_filter(ip, self.ipv4_only, self.private_only)
    }

    /// A packet is dropped when either endpoint is hidden.
    pub fn hides_packet(&self, source: IpAddr, destination: IpAddr) -> bool {
        self.hides(source) || self.hides(destination)
    }

    pub fn is_active(&self) -> bool {
        self.ipv4_only || self.private_only
    }
}

pub fn should_filter(ip: IpAddr, ipv4_only: bool, private_only: bool) -> bool {
    if ipv4_only && ip.is_ipv6() {
        return true;
    }
    private_only && !is_private(ip)
}

/// RFC 1918 and loopback for IPv4; unique-local, link-local and loopback
/// for IPv6.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            first & 0xfe00 == 0xfc00 || first == 0xfe80 || v6.is_loopback()
        }
    }
}
