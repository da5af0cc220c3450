pub mod domain {
    use std::collections::BTreeSet;
    use std::fmt;
    use std::net::IpAddr;

    use serde::{Serialize, Serializer};

    use crate::parser::{Decoded, MacAddr, TransportKind};
    use crate::protocol::Protocol;

    /// One frame as it came off the wire, kept for the archive.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RawFrame {
        pub ts_sec: i64,
        pub ts_usec: i64,
        /// Length on the wire; `data.len()` is the captured length.
        pub orig_len: u32,
        pub data: Vec<u8>,
    }

    impl RawFrame {
        pub fn from_pcap(packet: &pcap::Packet<'_>) -> Self {
            RawFrame {
                ts_sec: packet.header.ts.tv_sec as i64,
                ts_usec: packet.header.ts.tv_usec as i64,
                orig_len: packet.header.len,
                data: packet.data.to_vec(),
            }
        }

        pub fn timestamp(&self) -> f64 {
            self.ts_sec as f64 + self.ts_usec as f64 / 1_000_000.0
        }
    }

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PacketRecord {
        pub timestamp: f64,
        pub source: IpAddr,
        pub destination: IpAddr,
        pub src_port: Option<u16>,
        pub dst_port: Option<u16>,
        pub protocol: Protocol,
        pub length: usize,
        pub flags: Option<u8>,
        pub source_mac: Option<MacAddr>,
        pub dest_mac: Option<MacAddr>,
        pub data: Vec<u8>,
        #[serde(skip)]
        pub transport: Option<TransportKind>,
    }

    impl PacketRecord {
        pub fn new(frame: &RawFrame, decoded: &Decoded<'_>, protocol: Protocol) -> Self {
            let (src_port, dst_port) = decoded.ports();
            PacketRecord {
                timestamp: frame.timestamp(),
                source: decoded.source(),
                destination: decoded.destination(),
                src_port,
                dst_port,
                protocol,
                length: frame.data.len(),
                flags: decoded.tcp_flags(),
                source_mac: decoded.src_mac,
                dest_mac: decoded.dst_mac,
                data: frame.data.clone(),
                transport: decoded.transport.map(|t| t.kind()),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Node {
        pub ip: IpAddr,
        pub packets_sent: u64,
        pub packets_received: u64,
        pub bytes_sent: u64,
        pub bytes_received: u64,
        pub protocols: BTreeSet<Protocol>,
        pub connections: u64,
        pub mac: Option<MacAddr>,
    }

    impl Node {
        pub fn new(ip: IpAddr) -> Self {
            Node {
                ip,
                packets_sent: 0,
                packets_received: 0,
                bytes_sent: 0,
                bytes_received: 0,
                protocols: BTreeSet::new(),
                connections: 0,
                mac: None,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Edge {
        pub source: IpAddr,
        pub destination: IpAddr,
        pub protocol: Protocol,
        pub packets: u64,
        pub bytes: u64,
        pub start_time: f64,
        pub last_time: f64,
    }

    impl Edge {
        pub fn new(packet: &PacketRecord) -> Self {
            Edge {
                source: packet.source,
                destination: packet.destination,
                protocol: packet.protocol,
                packets: 1,
                bytes: packet.length as u64,
                start_time: packet.timestamp,
                last_time: packet.timestamp,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum AlertKind {
        PortScan,
        LargeTransfer,
        SuspiciousPort,
        IcmpFlood,
    }

    impl AlertKind {
        pub fn label(&self) -> &'static str {
            match self {
                AlertKind::PortScan => "Potential Port Scan",
                AlertKind::LargeTransfer => "Large Data Transfer",
                AlertKind::SuspiciousPort => "Suspicious Port Activity",
                AlertKind::IcmpFlood => "ICMP Flood",
            }
        }
    }

    impl fmt::Display for AlertKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.label())
        }
    }

    impl Serialize for AlertKind {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(self.label())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Severity {
        Medium,
        High,
    }

    #[derive(Debug, Clone, Serialize)]
    pub struct Alert {
        #[serde(rename = "type")]
        pub kind: AlertKind,
        pub severity: Severity,
        pub source: IpAddr,
        pub destination: IpAddr,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub size: Option<usize>,
        pub protocol: Protocol,
        pub timestamp: f64,
        pub details: String,
    }
}

pub mod dto {
    use std::collections::BTreeMap;
    use std::net::IpAddr;

    use serde::Serialize;

    use super::domain::{Alert, Edge, Node, PacketRecord};
    use crate::parser::MacAddr;
    use crate::protocol::Protocol;

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct NodeView {
        pub id: IpAddr,
        pub hostname: Option<String>,
        pub mac: Option<MacAddr>,
        pub packets_sent: u64,
        pub packets_received: u64,
        pub bytes_sent: u64,
        pub bytes_received: u64,
        pub protocols: Vec<Protocol>,
        pub connections: u64,
    }

    impl NodeView {
        pub fn new(node: &Node, hostname: Option<String>) -> Self {
            NodeView {
                id: node.ip,
                hostname,
                mac: node.mac,
                packets_sent: node.packets_sent,
                packets_received: node.packets_received,
                bytes_sent: node.bytes_sent,
                bytes_received: node.bytes_received,
                protocols: node.protocols.iter().copied().collect(),
                connections: node.connections,
            }
        }
    }

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct EdgeView {
        pub source: IpAddr,
        pub target: IpAddr,
        pub protocol: Protocol,
        pub packets: u64,
        pub bytes: u64,
        pub start_time: f64,
        pub last_time: f64,
    }

    impl From<&Edge> for EdgeView {
        fn from(edge: &Edge) -> Self {
            EdgeView {
                source: edge.source,
                target: edge.destination,
                protocol: edge.protocol,
                packets: edge.packets,
                bytes: edge.bytes,
                start_time: edge.start_time,
                last_time: edge.last_time,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Statistics {
        pub unique_hosts: usize,
        pub active_connections: usize,
        pub total_packets: u64,
        pub total_nodes: usize,
        pub total_edges: usize,
        #[serde(rename = "dataVolumeMB")]
        pub data_volume_mb: f64,
        pub avg_packet_size: u64,
        pub protocol_count: usize,
        pub packets_per_sec: u64,
        pub bandwidth_mbps: f64,
        pub packets_dropped: u64,
        pub buffer_size: usize,
        pub threats_found: usize,
    }

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Batch {
        pub packets: Vec<PacketRecord>,
        pub count: usize,
        pub nodes: Vec<NodeView>,
        pub edges: Vec<EdgeView>,
        pub total_captured: u64,
        pub dns_cache: BTreeMap<String, Option<String>>,
        pub statistics: Statistics,
        pub alerts: Vec<Alert>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct OfflineSummary {
        pub total_packets: u64,
        pub unique_hosts: usize,
        pub active_connections: usize,
        #[serde(rename = "dataVolumeMB")]
        pub data_volume_mb: f64,
        pub avg_packet_size: u64,
        pub protocol_count: usize,
        pub packets_per_sec: u64,
        pub bandwidth_mbps: f64,
        pub duration: f64,
        pub threats_found: usize,
    }

    #[derive(Debug, Clone, Serialize)]
    pub struct OfflineReport {
        pub summary: OfflineSummary,
        pub hosts: Vec<NodeView>,
        pub connections: Vec<EdgeView>,
        pub packets: Vec<PacketRecord>,
        pub alerts: Vec<Alert>,
    }

    pub(crate) fn megabytes(bytes: u64) -> f64 {
        round2(bytes as f64 / (1024.0 * 1024.0))
    }

    pub(crate) fn round2(value: f64) -> f64 {
        (value * 100.0).round() / 100.0
    }

    /// (packets/sec, Mbps) over `duration` seconds.
    pub(crate) fn rates(packets: u64, bytes: u64, duration: f64) -> (u64, f64) {
        let pps = (packets as f64 / duration).round() as u64;
        let mbps = round2(bytes as f64 * 8.0 / duration / 1_000_000.0);
        (pps, mbps)
    }

    pub(crate) fn average(bytes: u64, packets: u64) -> u64 {
        if packets == 0 {
            0
        } else {
            (bytes as f64 / packets as f64).round() as u64
        }
    }
}
