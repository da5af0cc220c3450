use std::sync::Arc;

use crate::aggregate::Aggregator;
use crate::detection::ThreatEngine;
use crate::dns::DnsCache;
use crate::filter::VisibilityPolicy;
use crate::models::domain::{Alert, PacketRecord, RawFrame};
use crate::parser::{self, LinkLayer};
use crate::protocol;

/// decode -> classify -> filter -> aggregate -> detect, shared by every source
#[derive(Debug)]
pub struct Pipeline {
    policy: VisibilityPolicy,
    aggregator: Aggregator,
    detector: ThreatEngine,
    alerts: Vec<Alert>,
    undecodable: u64,
}

impl Pipeline {
    pub fn new(policy: VisibilityPolicy, dns: Option<Arc<DnsCache>>) -> Self {
        Pipeline {
            policy,
            aggregator: Aggregator::new(dns),
            detector: ThreatEngine::new(),
            alerts: Vec::new(),
            undecodable: 0,
        }
    }

    /// Run one frame through the pipeline. `None` when it carried no
    /// ARP/IP or an endpoint is hidden.
    pub fn process(&mut self, frame: &RawFrame, link: LinkLayer) -> Option<PacketRecord> {
        let Some(decoded) = parser::decode(&frame.data, link) else {
            self.undecodable += 1;
            return None;
        };
        if self.policy.hides_packet(decoded.source(), decoded.destination()) {
            return None;
        }

        let protocol = protocol::classify(&decoded);
        let record = PacketRecord::new(frame, &decoded, protocol);
        self.aggregator.ingest(&record);
        self.alerts.extend(self.detector.inspect(&record));
        Some(record)
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn undecodable(&self) -> u64 {
        self.undecodable
    }

    /// Consume the pipeline, returning its alerts ordered by timestamp.
    pub fn into_parts(self) -> (Aggregator, Vec<Alert>) {
        let mut alerts = self.alerts;
        alerts.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        (self.aggregator, alerts)
    }
}
