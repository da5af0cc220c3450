// raw link-layer frame -> addresses, ports, flags
// etherparse does Ethernet/IP/TCP/UDP; ARP and the cooked headers are read by hand

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use serde::{Serialize, Serializer};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_ARP: u16 = 0x0806;
const ETHERTYPE_IPV6: u16 = 0x86DD;

const ETHERNET_HEADER_LEN: usize = 14;
const SLL_HEADER_LEN: usize = 16;
const SLL2_HEADER_LEN: usize = 20;
const NULL_HEADER_LEN: usize = 4;
const ARP_IPV4_LEN: usize = 28;

/// Link-layer framing of a capture, from its pcap DLT value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    LinuxSll,
    LinuxSll2,
    RawIp,
    Null,
    Unsupported(i32),
}

impl LinkLayer {
    pub fn from_dlt(dlt: i32) -> Self {
        match dlt {
            1 => LinkLayer::Ethernet,
            113 => LinkLayer::LinuxSll,
            276 => LinkLayer::LinuxSll2,
            12 | 14 | 101 | 228 | 229 => LinkLayer::RawIp,
            0 | 108 => LinkLayer::Null,
            other => LinkLayer::Unsupported(other),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(MacAddr(octets))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Arp { sender: Ipv4Addr, target: Ipv4Addr },
    Ipv4 { src: Ipv4Addr, dst: Ipv4Addr },
    Ipv6 { src: Ipv6Addr, dst: Ipv6Addr, next_header: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
    Icmpv4,
    Icmpv6,
}

#[derive(Debug, Clone, Copy)]
pub enum Transport<'a> {
    Tcp { src_port: u16, dst_port: u16, flags: u8, payload: &'a [u8] },
    Udp { src_port: u16, dst_port: u16, payload: &'a [u8] },
    Icmpv4,
    Icmpv6,
}

impl Transport<'_> {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Tcp { .. } => TransportKind::Tcp,
            Transport::Udp { .. } => TransportKind::Udp,
            Transport::Icmpv4 => TransportKind::Icmpv4,
            Transport::Icmpv6 => TransportKind::Icmpv6,
        }
    }
}

/// The layers of one frame that the pipeline cares about.
#[derive(Debug, Clone, Copy)]
pub struct Decoded<'a> {
    pub src_mac: Option<MacAddr>,
    pub dst_mac: Option<MacAddr>,
    pub network: Network,
    pub transport: Option<Transport<'a>>,
}

impl Decoded<'_> {
    pub fn source(&self) -> IpAddr {
        match self.network {
            Network::Arp { sender, .. } => IpAddr::V4(sender),
            Network::Ipv4 { src, .. } => IpAddr::V4(src),
            Network::Ipv6 { src, .. } => IpAddr::V6(src),
        }
    }

    pub fn destination(&self) -> IpAddr {
        match self.network {
            Network::Arp { target, .. } => IpAddr::V4(target),
            Network::Ipv4 { dst, .. } => IpAddr::V4(dst),
            Network::Ipv6 { dst, .. } => IpAddr::V6(dst),
        }
    }

    pub fn ports(&self) -> (Option<u16>, Option<u16>) {
        match self.transport {
            Some(Transport::Tcp { src_port, dst_port, .. })
            | Some(Transport::Udp { src_port, dst_port, .. }) => (Some(src_port), Some(dst_port)),
            _ => (None, None),
        }
    }

    pub fn tcp_flags(&self) -> Option<u8> {
        match self.transport {
            Some(Transport::Tcp { flags, .. }) => Some(flags),
            _ => None,
        }
    }
}

/// Decode a captured frame. Returns `None` for anything that carries
/// neither ARP nor IP.
pub fn decode(data: &[u8], link: LinkLayer) -> Option<Decoded<'_>> {
    match link {
        LinkLayer::Ethernet => handle_ethernet(data),
        LinkLayer::LinuxSll => {
            let header = data.get(..SLL_HEADER_LEN)?;
            let ether_type = u16::from_be_bytes([header[14], header[15]]);
            let addr_len = u16::from_be_bytes([header[4], header[5]]);
            let src_mac = if addr_len == 6 { MacAddr::from_slice(&header[6..12]) } else { None };
            handle_ether_type(ether_type, &data[SLL_HEADER_LEN..], src_mac, None)
        }
        LinkLayer::LinuxSll2 => {
            let header = data.get(..SLL2_HEADER_LEN)?;
            let ether_type = u16::from_be_bytes([header[0], header[1]]);
            let src_mac = if header[11] == 6 { MacAddr::from_slice(&header[12..18]) } else { None };
            handle_ether_type(ether_type, &data[SLL2_HEADER_LEN..], src_mac, None)
        }
        LinkLayer::RawIp => handle_ip(data, None, None),
        LinkLayer::Null => handle_ip(data.get(NULL_HEADER_LEN..)?, None, None),
        LinkLayer::Unsupported(_) => None,
    }
}

fn handle_ethernet(data: &[u8]) -> Option<Decoded<'_>> {
    let header = data.get(..ETHERNET_HEADER_LEN)?;
    let dst_mac = MacAddr::from_slice(&header[0..6]);
    let src_mac = MacAddr::from_slice(&header[6..12]);
    let ether_type = u16::from_be_bytes([header[12], header[13]]);

    if ether_type == ETHERTYPE_ARP {
        return handle_arp(&data[ETHERNET_HEADER_LEN..], src_mac, dst_mac);
    }

    match SlicedPacket::from_ethernet(data) {
        Ok(sliced) => from_sliced(&sliced, src_mac, dst_mac),
        // truncated or odd transport: keep the addresses at least
        Err(_) if ether_type == ETHERTYPE_IPV4 || ether_type == ETHERTYPE_IPV6 => {
            fallback_ip(&data[ETHERNET_HEADER_LEN..], src_mac, dst_mac)
        }
        Err(_) => None,
    }
}

fn handle_ether_type(
    ether_type: u16,
    payload: &[u8],
    src_mac: Option<MacAddr>,
    dst_mac: Option<MacAddr>,
) -> Option<Decoded<'_>> {
    match ether_type {
        ETHERTYPE_ARP => handle_arp(payload, src_mac, dst_mac),
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => handle_ip(payload, src_mac, dst_mac),
        _ => None,
    }
}

fn handle_ip(payload: &[u8], src_mac: Option<MacAddr>, dst_mac: Option<MacAddr>) -> Option<Decoded<'_>> {
    match SlicedPacket::from_ip(payload) {
        Ok(sliced) => from_sliced(&sliced, src_mac, dst_mac),
        Err(_) => fallback_ip(payload, src_mac, dst_mac),
    }
}

fn handle_arp(payload: &[u8], src_mac: Option<MacAddr>, dst_mac: Option<MacAddr>) -> Option<Decoded<'_>> {
    let arp = payload.get(..ARP_IPV4_LEN)?;
    // Ethernet hardware addresses, IPv4 protocol addresses only
    if arp[4] != 6 || arp[5] != 4 {
        return None;
    }
    let sender_mac = MacAddr::from_slice(&arp[8..14]);
    let sender = Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]);
    let target_mac = MacAddr::from_slice(&arp[18..24]);
    let target = Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]);

    Some(Decoded {
        src_mac: src_mac.or(sender_mac),
        dst_mac: dst_mac.or(target_mac),
        network: Network::Arp { sender, target },
        transport: None,
    })
}

fn from_sliced<'a>(
    sliced: &SlicedPacket<'a>,
    src_mac: Option<MacAddr>,
    dst_mac: Option<MacAddr>,
) -> Option<Decoded<'a>> {
    #[allow(unreachable_patterns)]
    let network = match sliced.net.as_ref()? {
        NetSlice::Ipv4(ipv4) => Network::Ipv4 {
            src: ipv4.header().source_addr(),
            dst: ipv4.header().destination_addr(),
        },
        NetSlice::Ipv6(ipv6) => Network::Ipv6 {
            src: ipv6.header().source_addr(),
            dst: ipv6.header().destination_addr(),
            next_header: ipv6.header().next_header().0,
        },
        _ => return None,
    };

    #[allow(unreachable_patterns)]
    let transport = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Some(Transport::Tcp {
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            flags: u8::from(tcp.fin())
                | u8::from(tcp.syn()) << 1
                | u8::from(tcp.rst()) << 2
                | u8::from(tcp.psh()) << 3
                | u8::from(tcp.ack()) << 4
                | u8::from(tcp.urg()) << 5
                | u8::from(tcp.ece()) << 6
                | u8::from(tcp.cwr()) << 7,
            payload: tcp.payload(),
        }),
        Some(TransportSlice::Udp(udp)) => Some(Transport::Udp {
            src_port: udp.source_port(),
            dst_port: udp.destination_port(),
            payload: udp.payload(),
        }),
        Some(TransportSlice::Icmpv4(_)) => Some(Transport::Icmpv4),
        Some(TransportSlice::Icmpv6(_)) => Some(Transport::Icmpv6),
        _ => None,
    };

    Some(Decoded { src_mac, dst_mac, network, transport })
}

fn fallback_ip(bytes: &[u8], src_mac: Option<MacAddr>, dst_mac: Option<MacAddr>) -> Option<Decoded<'_>> {
    let version = bytes.first()? >> 4;
    let network = match version {
        4 if bytes.len() >= 20 => Network::Ipv4 {
            src: Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]),
            dst: Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]),
        },
        6 if bytes.len() >= 40 => {
            let src: [u8; 16] = bytes[8..24].try_into().ok()?;
            let dst: [u8; 16] = bytes[24..40].try_into().ok()?;
            Network::Ipv6 { src: Ipv6Addr::from(src), dst: Ipv6Addr::from(dst), next_header: bytes[6] }
        }
        _ => return None,
    };
    Some(Decoded { src_mac, dst_mac, network, transport: None })
}
