use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::dns::{self, DnsCache, ReverseResolver};
use crate::error::{CaptureError, Result};
use crate::filter::VisibilityPolicy;
use crate::models::domain::RawFrame;
use crate::models::dto::{self, OfflineReport, OfflineSummary};
use crate::parser::LinkLayer;
use crate::pipeline::Pipeline;

const MIN_DURATION_SECS: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
pub struct OfflineOptions {
    pub resolve_dns: bool,
    pub policy: VisibilityPolicy,
    pub dns_timeout: Duration,
    pub dns_parallelism: usize,
}

impl Default for OfflineOptions {
    fn default() -> Self {
        OfflineOptions {
            resolve_dns: true,
            policy: VisibilityPolicy::default(),
            dns_timeout: Duration::from_secs(2),
            dns_parallelism: 5,
        }
    }
}

/// Analyze a whole capture file in one pass. Any read failure aborts the
/// analysis with [`CaptureError::Decode`].
pub fn analyze(path: &Path, options: &OfflineOptions, resolver: Arc<dyn ReverseResolver>) -> Result<OfflineReport> {
    let decode_error = |reason: String| CaptureError::Decode { path: path.to_path_buf(), reason };

    let mut capture = pcap::Capture::from_file(path).map_err(|e| decode_error(e.to_string()))?;
    let link = LinkLayer::from_dlt(capture.get_datalink().0);
    let dns_cache = options.resolve_dns.then(|| Arc::new(DnsCache::new()));
    let mut pipeline = Pipeline::new(options.policy, dns_cache.clone());

    let mut frames = 0u64;
    let mut bytes = 0u64;
    let mut first_ts = None;
    let mut last_ts = None;
    let mut packets = Vec::new();
    loop {
        let frame = match capture.next_packet() {
            Ok(packet) => RawFrame::from_pcap(&packet),
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => return Err(decode_error(e.to_string())),
        };
        frames += 1;
        bytes += frame.data.len() as u64;
        first_ts.get_or_insert(frame.timestamp());
        last_ts = Some(frame.timestamp());
        if let Some(record) = pipeline.process(&frame, link) {
            packets.push(record);
        }
    }

    if let Some(cache) = &dns_cache {
        dns::resolve_all_blocking(cache, &resolver, options.dns_parallelism, options.dns_timeout);
    }

    let (aggregator, alerts) = pipeline.into_parts();
    let duration = match (first_ts, last_ts) {
        (Some(first), Some(last)) => (last - first).max(MIN_DURATION_SECS),
        _ => MIN_DURATION_SECS,
    };
    let (packets_per_sec, bandwidth_mbps) = dto::rates(frames, bytes, duration);
    let summary = OfflineSummary {
        total_packets: frames,
        unique_hosts: aggregator.node_count(),
        active_connections: aggregator.edge_count(),
        data_volume_mb: dto::megabytes(bytes),
        avg_packet_size: dto::average(bytes, frames),
        protocol_count: aggregator.protocol_count(),
        packets_per_sec,
        bandwidth_mbps,
        duration: dto::round2(duration),
        threats_found: alerts.len(),
    };
    info!(
        file = %path.display(),
        packets = frames,
        visible = packets.len(),
        hosts = summary.unique_hosts,
        alerts = alerts.len(),
        "offline analysis finished"
    );

    Ok(OfflineReport {
        summary,
        hosts: aggregator.node_views(dns_cache.as_deref()),
        connections: aggregator.edge_views(),
        packets,
        alerts,
    })
}
