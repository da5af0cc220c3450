use std::fmt;

use serde::{Serialize, Serializer};

use crate::parser::{Decoded, Network, Transport};

/// Application-level label attached to every packet and recorded per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Arp,
    Dns,
    Bootp,
    Http,
    Https,
    HttpAlt,
    HttpsAlt,
    Ssh,
    Telnet,
    Rdp,
    Vnc,
    Ftp,
    FtpData,
    Tftp,
    Smb,
    NetBios,
    Smtp,
    SmtpSubmission,
    Pop3,
    Imap,
    Imaps,
    Pop3s,
    MySql,
    PostgreSql,
    MsSql,
    MongoDb,
    Redis,
    Squid,
    HttpProxy,
    HttpDev,
    Tcp,
    Dhcp,
    Ntp,
    Snmp,
    Syslog,
    Ssdp,
    Mdns,
    Udp,
    Icmp,
    TcpIpv6,
    UdpIpv6,
    Ipv6,
    Other,
}

impl Protocol {
    pub fn label(&self) -> &'static str {
        match self {
            Protocol::Arp => "ARP",
            Protocol::Dns => "DNS",
            Protocol::Bootp => "BOOTP",
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
            Protocol::HttpAlt => "HTTP-ALT",
            Protocol::HttpsAlt => "HTTPS-ALT",
            Protocol::Ssh => "SSH",
            Protocol::Telnet => "TELNET",
            Protocol::Rdp => "RDP",
            Protocol::Vnc => "VNC",
            Protocol::Ftp => "FTP",
            Protocol::FtpData => "FTP-DATA",
            Protocol::Tftp => "TFTP",
            Protocol::Smb => "SMB",
            Protocol::NetBios => "NetBIOS",
            Protocol::Smtp => "SMTP",
            Protocol::SmtpSubmission => "SMTP-SUBMISSION",
            Protocol::Pop3 => "POP3",
            Protocol::Imap => "IMAP",
            Protocol::Imaps => "IMAPS",
            Protocol::Pop3s => "POP3S",
            Protocol::MySql => "MySQL",
            Protocol::PostgreSql => "PostgreSQL",
            Protocol::MsSql => "MSSQL",
            Protocol::MongoDb => "MongoDB",
            Protocol::Redis => "Redis",
            Protocol::Squid => "SQUID",
            Protocol::HttpProxy => "HTTP-PROXY",
            Protocol::HttpDev => "HTTP-DEV",
            Protocol::Tcp => "TCP",
            Protocol::Dhcp => "DHCP",
            Protocol::Ntp => "NTP",
            Protocol::Snmp => "SNMP",
            Protocol::Syslog => "SYSLOG",
            Protocol::Ssdp => "SSDP",
            Protocol::Mdns => "mDNS",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::TcpIpv6 => "TCP/IPv6",
            Protocol::UdpIpv6 => "UDP/IPv6",
            Protocol::Ipv6 => "IPv6",
            Protocol::Other => "Other",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for Protocol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

// (low, high, label), first match wins, either port may match
const TCP_SERVICES: &[(u16, u16, Protocol)] = &[
    (80, 80, Protocol::Http),
    (443, 443, Protocol::Https),
    (8080, 8080, Protocol::HttpAlt),
    (8443, 8443, Protocol::HttpsAlt),
    (22, 22, Protocol::Ssh),
    (23, 23, Protocol::Telnet),
    (3389, 3389, Protocol::Rdp),
    (5900, 5910, Protocol::Vnc),
    (21, 21, Protocol::Ftp),
    (20, 20, Protocol::FtpData),
    (69, 69, Protocol::Tftp),
    (445, 445, Protocol::Smb),
    (139, 139, Protocol::NetBios),
    (25, 25, Protocol::Smtp),
    (587, 587, Protocol::SmtpSubmission),
    (110, 110, Protocol::Pop3),
    (143, 143, Protocol::Imap),
    (993, 993, Protocol::Imaps),
    (995, 995, Protocol::Pop3s),
    (3306, 3306, Protocol::MySql),
    (5432, 5432, Protocol::PostgreSql),
    (1433, 1433, Protocol::MsSql),
    (27017, 27017, Protocol::MongoDb),
    (6379, 6379, Protocol::Redis),
    (3128, 3128, Protocol::Squid),
    (8888, 8888, Protocol::HttpProxy),
    (9000, 9001, Protocol::HttpDev),
];

const UDP_SERVICES: &[(u16, u16, Protocol)] = &[
    (53, 53, Protocol::Dns),
    (67, 68, Protocol::Dhcp),
    (69, 69, Protocol::Tftp),
    (123, 123, Protocol::Ntp),
    (161, 162, Protocol::Snmp),
    (514, 514, Protocol::Syslog),
    (1900, 1900, Protocol::Ssdp),
    (5353, 5353, Protocol::Mdns),
];

const HTTP_PREFIXES: [&[u8]; 6] = [b"GET ", b"POST", b"HTTP", b"HEAD", b"PUT ", b"DELE"];

const DNS_HEADER_LEN: usize = 12;
const BOOTP_MIN_LEN: usize = 236;

/// Label a decoded frame.
///
/// Precedence: ARP, a DNS message on port 53, a BOOTP message between
/// ports 67 and 68, the TCP port table then an HTTP payload sniff, the UDP
/// port table, ICMP, and finally the bare IPv6 next-header.
pub fn classify(decoded: &Decoded<'_>) -> Protocol {
    if let Network::Arp { .. } = decoded.network {
        return Protocol::Arp;
    }

    match decoded.transport {
        Some(Transport::Tcp { src_port, dst_port, payload, .. }) => {
            if carries_dns(src_port, dst_port, payload) {
                return Protocol::Dns;
            }
            if let Some(protocol) = lookup(TCP_SERVICES, src_port, dst_port) {
                return protocol;
            }
            match payload.get(..4) {
                Some(prefix) if HTTP_PREFIXES.contains(&prefix) => Protocol::Http,
                _ => Protocol::Tcp,
            }
        }
        Some(Transport::Udp { src_port, dst_port, payload }) => {
            if carries_dns(src_port, dst_port, payload) {
                return Protocol::Dns;
            }
            if matches!((src_port, dst_port), (68, 67) | (67, 68)) && payload.len() >= BOOTP_MIN_LEN {
                return Protocol::Bootp;
            }
            lookup(UDP_SERVICES, src_port, dst_port).unwrap_or(Protocol::Udp)
        }
        Some(Transport::Icmpv4) => Protocol::Icmp,
        Some(Transport::Icmpv6) => Protocol::Ipv6,
        None => match decoded.network {
            Network::Ipv6 { next_header: 6, .. } => Protocol::TcpIpv6,
            Network::Ipv6 { next_header: 17, .. } => Protocol::UdpIpv6,
            Network::Ipv6 { .. } => Protocol::Ipv6,
            _ => Protocol::Other,
        },
    }
}

fn carries_dns(src_port: u16, dst_port: u16, payload: &[u8]) -> bool {
    (src_port == 53 || dst_port == 53) && payload.len() >= DNS_HEADER_LEN
}

fn lookup(table: &[(u16, u16, Protocol)], src_port: u16, dst_port: u16) -> Option<Protocol> {
    table
        .iter()
        .find(|(low, high, _)| (*low..=*high).contains(&src_port) || (*low..=*high).contains(&dst_port))
        .map(|(_, _, protocol)| *protocol)
}
