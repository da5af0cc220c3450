use std::collections::VecDeque;
use std::net::IpAddr;

use tracing::debug;

use crate::models::domain::{Alert, AlertKind, PacketRecord, Severity};
use crate::parser::TransportKind;
use crate::protocol::Protocol;

pub const SCAN_PORTS: [u16; 10] = [21, 22, 23, 25, 80, 139, 443, 445, 3389, 5900];
pub const MALWARE_PORTS: [u16; 7] = [4444, 5555, 6666, 7777, 8888, 9999, 31337];

const LARGE_PACKET_BYTES: usize = 15_000;
const SYN_ONLY: u8 = 0x02;
const ICMP_WINDOW_SECS: f64 = 1.0;
const ICMP_FLOOD_THRESHOLD: usize = 20;
const RECENT_ALERTS: usize = 5;

/// Per-packet heuristics plus the ICMP sliding window.
#[derive(Debug, Default)]
pub struct ThreatEngine {
    icmp_log: VecDeque<(f64, IpAddr)>,
    recent: VecDeque<(AlertKind, IpAddr)>,
}

impl ThreatEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inspect(&mut self, packet: &PacketRecord) -> Vec<Alert> {
        let mut alerts = Vec::new();

        // Detect SYN probes against commonly scanned services
        if packet.transport == Some(TransportKind::Tcp) && packet.flags == Some(SYN_ONLY) {
            if let Some(port) = packet.dst_port.filter(|p| SCAN_PORTS.contains(p)) {
                self.raise(&mut alerts, Alert {
                    kind: AlertKind::PortScan,
                    severity: Severity::High,
                    source: packet.source,
                    destination: packet.destination,
                    port: Some(port),
                    size: None,
                    protocol: Protocol::Tcp,
                    timestamp: packet.timestamp,
                    details: format!("SYN packet to common port {port}"),
                });
            }
        }

        // Detect oversized frames
        if packet.length > LARGE_PACKET_BYTES {
            self.raise(&mut alerts, Alert {
                kind: AlertKind::LargeTransfer,
                severity: Severity::Medium,
                source: packet.source,
                destination: packet.destination,
                port: None,
                size: Some(packet.length),
                protocol: packet.protocol,
                timestamp: packet.timestamp,
                details: format!("Unusually large packet: {} bytes", packet.length),
            });
        }

        // Detect traffic to ports favoured by backdoors
        if matches!(packet.transport, Some(TransportKind::Tcp) | Some(TransportKind::Udp)) {
            if let Some(port) = packet.dst_port.filter(|p| MALWARE_PORTS.contains(p)) {
                self.raise(&mut alerts, Alert {
                    kind: AlertKind::SuspiciousPort,
                    severity: Severity::High,
                    source: packet.source,
                    destination: packet.destination,
                    port: Some(port),
                    size: None,
                    protocol: packet.protocol,
                    timestamp: packet.timestamp,
                    details: format!("Connection to known malware port {port}"),
                });
            }
        }

        if packet.transport == Some(TransportKind::Icmpv4) {
            self.track_icmp(packet, &mut alerts);
        }

        alerts
    }

    fn track_icmp(&mut self, packet: &PacketRecord, alerts: &mut Vec<Alert>) {
        let now = packet.timestamp;
        while let Some(&(seen, _)) = self.icmp_log.front() {
            if now - seen >= ICMP_WINDOW_SECS {
                self.icmp_log.pop_front();
            } else {
                break;
            }
        }

        let count = self
            .icmp_log
            .iter()
            .filter(|(seen, source)| *source == packet.source && now - seen < ICMP_WINDOW_SECS)
            .count();
        self.icmp_log.push_back((now, packet.source));

        if count > ICMP_FLOOD_THRESHOLD {
            if self.recent.contains(&(AlertKind::IcmpFlood, packet.source)) {
                return;
            }
            self.raise(alerts, Alert {
                kind: AlertKind::IcmpFlood,
                severity: Severity::High,
                source: packet.source,
                destination: packet.destination,
                port: None,
                size: None,
                protocol: Protocol::Icmp,
                timestamp: now,
                details: format!("Potential ICMP flood attack detected ({} packets/sec)", count + 1),
            });
        }
    }

    fn raise(&mut self, alerts: &mut Vec<Alert>, alert: Alert) {
        debug!(kind = %alert.kind, source = %alert.source, "threat heuristic fired");
        if self.recent.len() == RECENT_ALERTS {
            self.recent.pop_front();
        }
        self.recent.push_back((alert.kind, alert.source));
        alerts.push(alert);
    }

    pub fn icmp_window_len(&self) -> usize {
        self.icmp_log.len()
    }
}
