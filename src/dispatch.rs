use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use crate::dns::DnsCache;
use crate::events::{CaptureEvent, EventSink};
use crate::models::dto::{self, Batch, Statistics};
use crate::session::SessionState;

const MIN_LIVE_DURATION_SECS: f64 = 0.001;

/// Builds batches from the pending buffer and a snapshot of the graph.
pub struct BatchDispatcher {
    state: Arc<Mutex<SessionState>>,
    dns: Option<Arc<DnsCache>>,
    max_packets: usize,
}

impl BatchDispatcher {
    pub(crate) fn new(state: Arc<Mutex<SessionState>>, dns: Option<Arc<DnsCache>>, max_packets: usize) -> Self {
        BatchDispatcher { state, dns, max_packets: max_packets.max(1) }
    }

    /// Take up to `max_packets` from the front of the buffer. `None` when
    /// nothing is pending.
    pub fn flush(&self) -> Option<Batch> {
        let mut state = self.state.lock();
        if state.buffer.is_empty() {
            return None;
        }
        let buffer_size = state.buffer.len();
        let packets = state.buffer.take_front(self.max_packets);
        let alerts = state.take_new_alerts();

        let aggregator = state.pipeline.aggregator();
        let totals = aggregator.totals();
        // rates run over capture time, not wall time
        let elapsed = totals.span().max(MIN_LIVE_DURATION_SECS);
        let nodes = aggregator.node_views(self.dns.as_deref());
        let edges = aggregator.edge_views();
        let (packets_per_sec, bandwidth_mbps) = dto::rates(totals.packets, totals.bytes, elapsed);
        let statistics = Statistics {
            unique_hosts: aggregator.node_count(),
            active_connections: aggregator.edge_count(),
            total_packets: totals.packets,
            total_nodes: aggregator.node_count(),
            total_edges: aggregator.edge_count(),
            data_volume_mb: dto::megabytes(totals.bytes),
            avg_packet_size: dto::average(totals.bytes, totals.packets),
            protocol_count: aggregator.protocol_count(),
            packets_per_sec,
            bandwidth_mbps,
            packets_dropped: state.buffer.dropped(),
            buffer_size,
            threats_found: state.pipeline.alerts().len(),
        };
        drop(state);

        let dns_cache = self.dns.as_ref().map(|cache| cache.snapshot()).unwrap_or_default();
        Some(Batch {
            count: packets.len(),
            packets,
            nodes,
            edges,
            total_captured: totals.packets,
            dns_cache,
            statistics,
            alerts,
        })
    }
}

pub fn spawn_dispatcher(
    runtime: &Handle,
    dispatcher: BatchDispatcher,
    sink: Arc<dyn EventSink>,
    running: Arc<AtomicBool>,
    period: Duration,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while running.load(Ordering::SeqCst) {
            interval.tick().await;
            if !running.load(Ordering::SeqCst) {
                break;
            }
            if let Some(batch) = dispatcher.flush() {
                debug!(
                    count = batch.count,
                    remaining = batch.statistics.buffer_size - batch.count,
                    nodes = batch.nodes.len(),
                    "dispatching batch"
                );
                sink.emit(CaptureEvent::PacketBatch(Box::new(batch)));
            }
        }
        debug!("dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::VisibilityPolicy;
    use crate::models::domain::RawFrame;
    use crate::parser::LinkLayer;
    use crate::pipeline::Pipeline;

    fn tcp_frame(src: [u8; 4], dst: [u8; 4], dst_port: u16, payload_len: usize, ts: i64) -> RawFrame {
        let mut data = vec![0x02, 0, 0, 0, 0, 0x02, 0x02, 0, 0, 0, 0, 0x01, 0x08, 0x00];
        let total = (20 + 20 + payload_len) as u16;
        data.extend_from_slice(&[0x45, 0]);
        data.extend_from_slice(&total.to_be_bytes());
        data.extend_from_slice(&[0, 0, 0x40, 0, 64, 6, 0, 0]);
        data.extend_from_slice(&src);
        data.extend_from_slice(&dst);
        data.extend_from_slice(&40000u16.to_be_bytes());
        data.extend_from_slice(&dst_port.to_be_bytes());
        data.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0x18, 0xff, 0xff, 0, 0, 0, 0]);
        data.resize(data.len() + payload_len, 0xab);
        RawFrame { ts_sec: ts, ts_usec: 0, orig_len: data.len() as u32, data }
    }

    fn dispatcher(capacity: usize, max_packets: usize) -> (Arc<Mutex<SessionState>>, BatchDispatcher) {
        let state = Arc::new(Mutex::new(SessionState::new(Pipeline::new(VisibilityPolicy::default(), None), capacity)));
        let dispatcher = BatchDispatcher::new(Arc::clone(&state), None, max_packets);
        (state, dispatcher)
    }

    #[test]
    fn test_empty_buffer_emits_nothing() {
        let (_, dispatcher) = dispatcher(10, 5);
        assert!(dispatcher.flush().is_none());
    }

    #[test]
    fn test_flush_takes_prefix_and_reports_depth() {
        let (state, dispatcher) = dispatcher(100, 5);
        for i in 0..12 {
            state.lock().ingest(&tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 443, 10, i), LinkLayer::Ethernet);
        }

        let first = dispatcher.flush().unwrap();
        assert_eq!(first.count, 5);
        assert_eq!(first.statistics.buffer_size, 12);
        assert_eq!(first.statistics.total_packets, 12);
        assert_eq!(first.total_captured, 12);
        assert_eq!(first.nodes.len(), 2);
        assert_eq!(first.edges.len(), 1);
        assert_eq!(first.packets[0].timestamp, 0.0);
        assert_eq!(first.statistics.avg_packet_size, 64);

        let second = dispatcher.flush().unwrap();
        assert_eq!(second.statistics.buffer_size, 7);
        assert_eq!(second.packets[0].timestamp, 5.0);
        assert_eq!(dispatcher.flush().unwrap().count, 2);
        assert!(dispatcher.flush().is_none());
    }

    #[test]
    fn test_rates_follow_packet_timestamps() {
        let (spread, over_eleven_secs) = dispatcher(100, 500);
        for i in 0..12 {
            spread.lock().ingest(&tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 443, 10, i), LinkLayer::Ethernet);
        }
        let stats = over_eleven_secs.flush().unwrap().statistics;
        assert_eq!(stats.packets_per_sec, 1);
        assert_eq!(stats.bandwidth_mbps, 0.0);

        // a single instant is measured over the 1 ms floor
        let (single, instant) = dispatcher(100, 500);
        single.lock().ingest(&tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 443, 10, 7), LinkLayer::Ethernet);
        assert_eq!(instant.flush().unwrap().statistics.packets_per_sec, 1000);
    }

    #[test]
    fn test_overflow_counts_drops() {
        let (state, dispatcher) = dispatcher(4, 500);
        for i in 0..10 {
            state.lock().ingest(&tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 443, 0, i), LinkLayer::Ethernet);
        }
        let batch = dispatcher.flush().unwrap();
        assert_eq!(batch.count, 4);
        assert_eq!(batch.statistics.packets_dropped, 6);
        // dropped packets were still aggregated
        assert_eq!(batch.statistics.total_packets, 10);
    }

    #[test]
    fn test_alerts_delivered_once() {
        let (state, dispatcher) = dispatcher(100, 500);
        state.lock().ingest(&tcp_frame([10, 0, 0, 5], [10, 0, 0, 6], 4444, 100, 1), LinkLayer::Ethernet);
        let batch = dispatcher.flush().unwrap();
        assert_eq!(batch.alerts.len(), 1);
        assert_eq!(batch.statistics.threats_found, 1);

        state.lock().ingest(&tcp_frame([10, 0, 0, 5], [10, 0, 0, 6], 443, 100, 2), LinkLayer::Ethernet);
        let batch = dispatcher.flush().unwrap();
        assert!(batch.alerts.is_empty());
        assert_eq!(batch.statistics.threats_found, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timer_emits_batches() {
        let (state, dispatcher) = dispatcher(100, 500);
        state.lock().ingest(&tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 80, 0, 1), LinkLayer::Ethernet);
        let (tx, rx) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let handle = spawn_dispatcher(&Handle::current(), dispatcher, Arc::new(tx), Arc::clone(&running), Duration::from_millis(20));

        let event = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2))).await.unwrap().unwrap();
        assert_eq!(event.name(), "packet_batch");
        running.store(false, Ordering::SeqCst);
        handle.abort();
    }
}
