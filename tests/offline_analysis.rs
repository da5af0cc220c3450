mod common;

use std::fs;
use std::net::IpAddr;
use std::sync::Arc;

use common::{at, icmp, tcp, udp, v4, write_pcap, TableResolver, TestFrame, BASE_TS};
use sniff::dns::ReverseResolver;
use sniff::error::CaptureError;
use sniff::filter::VisibilityPolicy;
use sniff::models::domain::AlertKind;
use sniff::offline::{analyze, OfflineOptions};
use sniff::protocol::Protocol;

fn no_dns() -> OfflineOptions {
    OfflineOptions { resolve_dns: false, ..OfflineOptions::default() }
}

fn resolver() -> Arc<dyn ReverseResolver> {
    Arc::new(TableResolver::default())
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// Nine ordinary HTTPS segments and one oversized segment to a backdoor port.
fn mixed_capture(dir: &std::path::Path) -> std::path::PathBuf {
    let mut frames: Vec<_> = (0..9)
        .map(|i| at(i * 1000, tcp(v4("10.0.0.1"), v4("10.0.0.2"), 40000, 443, 0x18, 10)))
        .collect();
    frames.push(at(9000, tcp(v4("10.0.0.5"), v4("10.0.0.6"), 40001, 4444, 0x18, 20_000 - 54)));
    let path = dir.join("mixed.pcap");
    write_pcap(&path, &frames);
    path
}

#[test]
fn test_offline_summary_and_alerts() {
    let dir = tempfile::tempdir().unwrap();
    let path = mixed_capture(dir.path());

    let report = analyze(&path, &no_dns(), resolver()).unwrap();

    let summary = &report.summary;
    assert_eq!(summary.total_packets, 10);
    assert_eq!(summary.unique_hosts, 4);
    assert_eq!(summary.active_connections, 2);
    assert_eq!(summary.duration, 9.0);
    assert_eq!(summary.avg_packet_size, (9 * 64 + 20_000 + 5) / 10);
    assert_eq!(summary.protocol_count, 2);
    assert_eq!(summary.threats_found, 2);

    let kinds: Vec<_> = report.alerts.iter().map(|a| a.kind).collect();
    assert!(kinds.contains(&AlertKind::LargeTransfer));
    assert!(kinds.contains(&AlertKind::SuspiciousPort));
    assert!(report.alerts.iter().all(|a| a.source == ip("10.0.0.5")));

    let https = report.connections.iter().find(|e| e.source == ip("10.0.0.1")).unwrap();
    assert_eq!(https.target, ip("10.0.0.2"));
    assert_eq!(https.protocol, Protocol::Https);
    assert_eq!(https.packets, 9);
    assert_eq!(https.last_time - https.start_time, 8.0);

    assert_eq!(report.packets.len(), 10);
    assert!(report.hosts.iter().all(|h| h.hostname.is_none()));
}

#[test]
fn test_offline_analysis_is_repeatable() {
    let dir = tempfile::tempdir().unwrap();
    let path = mixed_capture(dir.path());

    let first = serde_json::to_value(analyze(&path, &no_dns(), resolver()).unwrap()).unwrap();
    let second = serde_json::to_value(analyze(&path, &no_dns(), resolver()).unwrap()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_reply_traffic_shares_the_edge() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reply.pcap");
    write_pcap(&path, &[
        at(0, tcp(v4("192.168.1.10"), v4("192.168.1.20"), 50000, 22, 0x18, 32)),
        at(10, tcp(v4("192.168.1.20"), v4("192.168.1.10"), 22, 50000, 0x18, 64)),
        at(20, tcp(v4("192.168.1.10"), v4("192.168.1.20"), 50000, 22, 0x18, 32)),
    ]);

    let report = analyze(&path, &no_dns(), resolver()).unwrap();
    assert_eq!(report.connections.len(), 1);
    let edge = &report.connections[0];
    assert_eq!(edge.source, ip("192.168.1.10"));
    assert_eq!(edge.packets, 3);
    assert_eq!(edge.protocol, Protocol::Ssh);
    // short captures are measured over at least one second
    assert_eq!(report.summary.duration, 1.0);

    let client = report.hosts.iter().find(|h| h.id == ip("192.168.1.10")).unwrap();
    assert_eq!(client.packets_sent, 2);
    assert_eq!(client.packets_received, 1);
    assert_eq!(client.connections, 1);
}

#[test]
fn test_duration_reported_to_two_decimals() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("span.pcap");
    let frames: Vec<_> = (0..6)
        .map(|_| tcp(v4("10.0.0.1"), v4("10.0.0.2"), 40000, 443, 0x18, 10))
        .enumerate()
        .map(|(i, data)| match i {
            5 => TestFrame { ts_sec: BASE_TS + 2, ts_usec: 345_600, data },
            _ => at(i as u32 * 100, data),
        })
        .collect();
    write_pcap(&path, &frames);

    let summary = analyze(&path, &no_dns(), resolver()).unwrap().summary;
    assert_eq!(summary.duration, 2.35);
    // rates use the exact span: 6 / 2.3456 s
    assert_eq!(summary.packets_per_sec, 3);
}

#[test]
fn test_private_only_hides_public_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("filtered.pcap");
    write_pcap(&path, &[
        at(0, udp(v4("192.168.1.10"), v4("8.8.8.8"), 53000, 123, 48)),
        at(100, icmp(v4("192.168.1.10"), v4("192.168.1.1"))),
        at(200, tcp(v4("192.168.1.10"), v4("1.1.1.1"), 40000, 4444, 0x18, 10)),
    ]);
    let options = OfflineOptions {
        policy: VisibilityPolicy { ipv4_only: false, private_only: true },
        ..no_dns()
    };

    let report = analyze(&path, &options, resolver()).unwrap();
    // every frame counts toward the totals, only visible ones toward the graph
    assert_eq!(report.summary.total_packets, 3);
    assert_eq!(report.packets.len(), 1);
    assert_eq!(report.packets[0].protocol, Protocol::Icmp);
    assert_eq!(report.summary.unique_hosts, 2);
    assert!(report.hosts.iter().all(|h| h.id != ip("8.8.8.8") && h.id != ip("1.1.1.1")));
    assert!(report.alerts.is_empty());
}

#[test]
fn test_hostnames_resolved_after_pass() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dns.pcap");
    write_pcap(&path, &[at(0, tcp(v4("10.0.0.1"), v4("10.0.0.2"), 40000, 80, 0x18, 10))]);
    let table: Arc<dyn ReverseResolver> = Arc::new(TableResolver::with(&[("10.0.0.2", "web.lan")]));

    let report = analyze(&path, &OfflineOptions::default(), table).unwrap();
    let web = report.hosts.iter().find(|h| h.id == ip("10.0.0.2")).unwrap();
    assert_eq!(web.hostname.as_deref(), Some("web.lan"));
    let client = report.hosts.iter().find(|h| h.id == ip("10.0.0.1")).unwrap();
    assert_eq!(client.hostname, None);
}

#[test]
fn test_corrupt_capture_is_a_decode_error() {
    let dir = tempfile::tempdir().unwrap();
    let garbage = dir.path().join("garbage.pcap");
    fs::write(&garbage, b"this is not a capture file at all").unwrap();
    assert!(matches!(analyze(&garbage, &no_dns(), resolver()), Err(CaptureError::Decode { .. })));

    // valid header, then a record cut off inside its header
    let truncated = dir.path().join("truncated.pcap");
    write_pcap(&truncated, &[at(0, icmp(v4("10.0.0.1"), v4("10.0.0.2")))]);
    let mut bytes = fs::read(&truncated).unwrap();
    bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    fs::write(&truncated, bytes).unwrap();
    assert!(matches!(analyze(&truncated, &no_dns(), resolver()), Err(CaptureError::Decode { .. })));
}
