use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use crate::dns::DnsCache;
use crate::models::domain::{Edge, Node, PacketRecord};
use crate::models::dto::{EdgeView, NodeView};
use crate::parser::MacAddr;
use crate::protocol::Protocol;

/// Counters over every packet the aggregator has accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Totals {
    pub packets: u64,
    pub bytes: u64,
    pub first_timestamp: Option<f64>,
    pub last_timestamp: Option<f64>,
}

impl Totals {
    fn record(&mut self, packet: &PacketRecord) {
        self.packets += 1;
        self.bytes += packet.length as u64;
        self.first_timestamp.get_or_insert(packet.timestamp);
        self.last_timestamp = Some(packet.timestamp);
    }

    /// Seconds between the first and the last accepted packet.
    pub fn span(&self) -> f64 {
        match (self.first_timestamp, self.last_timestamp) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }
}

/// Host and flow tables for one session.
#[derive(Debug, Default)]
pub struct Aggregator {
    nodes: HashMap<IpAddr, Node>,
    edges: HashMap<(IpAddr, IpAddr), Edge>,
    dns: Option<Arc<DnsCache>>,
    totals: Totals,
}

impl Aggregator {
    pub fn new(dns: Option<Arc<DnsCache>>) -> Self {
        Aggregator { dns, ..Default::default() }
    }

    pub fn ingest(&mut self, packet: &PacketRecord) {
        let bytes = packet.length as u64;
        self.touch(packet.source, packet.source_mac);
        self.touch(packet.destination, packet.dest_mac);

        if let Some(sender) = self.nodes.get_mut(&packet.source) {
            sender.packets_sent += 1;
            sender.bytes_sent += bytes;
            sender.protocols.insert(packet.protocol);
        }
        if let Some(receiver) = self.nodes.get_mut(&packet.destination) {
            receiver.packets_received += 1;
            receiver.bytes_received += bytes;
            receiver.protocols.insert(packet.protocol);
        }

        let forward = (packet.source, packet.destination);
        let reverse = (packet.destination, packet.source);
        let key = if self.edges.contains_key(&forward) {
            Some(forward)
        } else if self.edges.contains_key(&reverse) {
            Some(reverse)
        } else {
            None
        };

        match key.and_then(|key| self.edges.get_mut(&key)) {
            Some(edge) => {
                edge.packets += 1;
                edge.bytes += bytes;
                edge.last_time = packet.timestamp;
            }
            None => {
                self.edges.insert(forward, Edge::new(packet));
                for endpoint in [packet.source, packet.destination] {
                    if let Some(node) = self.nodes.get_mut(&endpoint) {
                        node.connections += 1;
                    }
                }
            }
        }

        self.totals.record(packet);
    }

    fn touch(&mut self, ip: IpAddr, mac: Option<MacAddr>) {
        let node = self.nodes.entry(ip).or_insert_with(|| {
            if let Some(dns) = &self.dns {
                dns.enqueue(ip);
            }
            Node::new(ip)
        });

        if node.mac.is_none() && !ip.is_unspecified() {
            node.mac = mac.filter(|m| !m.is_zero());
        }
    }

    pub fn node(&self, ip: &IpAddr) -> Option<&Node> {
        self.nodes.get(ip)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn totals(&self) -> Totals {
        self.totals
    }

    pub fn protocol_count(&self) -> usize {
        self.nodes
            .values()
            .flat_map(|node| node.protocols.iter())
            .collect::<BTreeSet<&Protocol>>()
            .len()
    }

    /// Nodes sorted by address, with hostnames from `dns` when given.
    pub fn node_views(&self, dns: Option<&DnsCache>) -> Vec<NodeView> {
        let mut nodes: Vec<&Node> = self.nodes.values().collect();
        nodes.sort_by_key(|node| node.ip);
        nodes
            .into_iter()
            .map(|node| NodeView::new(node, dns.and_then(|cache| cache.hostname(&node.ip))))
            .collect()
    }

    pub fn edge_views(&self) -> Vec<EdgeView> {
        let mut edges: Vec<&Edge> = self.edges.values().collect();
        edges.sort_by_key(|edge| (edge.source, edge.destination));
        edges.into_iter().map(EdgeView::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(src: &str, dst: &str, length: usize, ts: f64, protocol: Protocol) -> PacketRecord {
        PacketRecord {
            timestamp: ts,
            source: src.parse().unwrap(),
            destination: dst.parse().unwrap(),
            src_port: Some(40000),
            dst_port: Some(443),
            protocol,
            length,
            flags: None,
            source_mac: None,
            dest_mac: None,
            data: Vec::new(),
            transport: None,
        }
    }

    #[test]
    fn test_reverse_direction_shares_one_edge() {
        let mut agg = Aggregator::new(None);
        agg.ingest(&packet("10.0.0.1", "10.0.0.2", 100, 1.0, Protocol::Https));
        agg.ingest(&packet("10.0.0.2", "10.0.0.1", 300, 2.5, Protocol::Tcp));
        agg.ingest(&packet("10.0.0.1", "10.0.0.2", 50, 3.0, Protocol::Https));

        assert_eq!(agg.edge_count(), 1);
        let edge = agg.edges().next().unwrap();
        assert_eq!(edge.packets, 3);
        assert_eq!(edge.bytes, 450);
        assert_eq!(edge.protocol, Protocol::Https);
        assert_eq!((edge.start_time, edge.last_time), (1.0, 3.0));
        assert_eq!(edge.source.to_string(), "10.0.0.1");

        let a = agg.node(&"10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(a.connections, 1);
        assert_eq!((a.packets_sent, a.packets_received), (2, 1));
        assert_eq!(a.protocols.len(), 2);
    }

    #[test]
    fn test_byte_totals_balance() {
        let mut agg = Aggregator::new(None);
        let hosts = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "192.168.1.7"];
        for i in 0..40usize {
            let src = hosts[i % hosts.len()];
            let dst = hosts[(i * 3 + 1) % hosts.len()];
            agg.ingest(&packet(src, dst, 60 + i * 7, i as f64, Protocol::Udp));
        }
        let sent: u64 = agg.nodes().map(|n| n.bytes_sent).sum();
        let received: u64 = agg.nodes().map(|n| n.bytes_received).sum();
        assert_eq!(sent, received);
        assert_eq!(sent, agg.totals().bytes);
        assert_eq!(agg.totals().packets, 40);
        assert_eq!(agg.totals().span(), 39.0);
    }

    #[test]
    fn test_first_nonzero_mac_wins() {
        let mut agg = Aggregator::new(None);
        let mut first = packet("10.0.0.1", "0.0.0.0", 60, 1.0, Protocol::Dhcp);
        first.source_mac = Some(MacAddr([0; 6]));
        first.dest_mac = Some(MacAddr([0xff; 6]));
        agg.ingest(&first);

        let mut second = packet("10.0.0.1", "10.0.0.2", 60, 2.0, Protocol::Tcp);
        second.source_mac = Some(MacAddr([2, 0, 0, 0, 0, 1]));
        agg.ingest(&second);

        let mut third = packet("10.0.0.1", "10.0.0.2", 60, 3.0, Protocol::Tcp);
        third.source_mac = Some(MacAddr([2, 0, 0, 0, 0, 9]));
        agg.ingest(&third);

        let host = agg.node(&"10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(host.mac, Some(MacAddr([2, 0, 0, 0, 0, 1])));
        assert_eq!(agg.node(&"0.0.0.0".parse().unwrap()).unwrap().mac, None);
    }

    #[test]
    fn test_new_hosts_are_queued_for_dns() {
        let dns = Arc::new(DnsCache::new());
        let mut agg = Aggregator::new(Some(Arc::clone(&dns)));
        agg.ingest(&packet("10.0.0.1", "10.0.0.2", 60, 1.0, Protocol::Tcp));
        agg.ingest(&packet("10.0.0.2", "10.0.0.1", 60, 1.1, Protocol::Tcp));
        agg.ingest(&packet("10.0.0.1", "10.0.0.3", 60, 1.2, Protocol::Tcp));
        assert_eq!(dns.queued(), 3);

        dns.record("10.0.0.1".parse().unwrap(), Some("gw.lan".into()));
        let views = agg.node_views(Some(&dns));
        assert_eq!(views[0].hostname.as_deref(), Some("gw.lan"));
        assert_eq!(views.iter().map(|v| v.id.to_string()).collect::<Vec<_>>(), vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(agg.protocol_count(), 1);
    }
}
