use std::io::Write;

use crossbeam_channel::Sender;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::dto::Batch;

/// Notifications for the delivery layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum CaptureEvent {
    CaptureStarted { interface: String },
    CaptureError { message: String },
    CaptureStopped {},
    CaptureRestarted { interface: String },
    PacketBatch(Box<Batch>),
    PcapSaved {
        filename: String,
        #[serde(rename = "packetCount")]
        packet_count: usize,
    },
    InterfaceReady { interface: String },
}

impl CaptureEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CaptureEvent::CaptureStarted { .. } => "capture_started",
            CaptureEvent::CaptureError { .. } => "capture_error",
            CaptureEvent::CaptureStopped {} => "capture_stopped",
            CaptureEvent::CaptureRestarted { .. } => "capture_restarted",
            CaptureEvent::PacketBatch(_) => "packet_batch",
            CaptureEvent::PcapSaved { .. } => "pcap_saved",
            CaptureEvent::InterfaceReady { .. } => "interface_ready",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: CaptureEvent);
}

impl EventSink for Sender<CaptureEvent> {
    fn emit(&self, event: CaptureEvent) {
        let name = event.name();
        if self.send(event).is_err() {
            debug!(event = name, "event receiver gone");
        }
    }
}

/// Writes one JSON object per event to stdout.
#[derive(Debug, Default)]
pub struct JsonLinesSink;

impl EventSink for JsonLinesSink {
    fn emit(&self, event: CaptureEvent) {
        let mut out = std::io::stdout().lock();
        let written = serde_json::to_writer(&mut out, &event)
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(out))
            .and_then(|()| out.flush());
        if let Err(e) = written {
            warn!(event = event.name(), error = %e, "failed to write event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_envelope() {
        let started = serde_json::to_value(CaptureEvent::CaptureStarted { interface: "eth0".into() }).unwrap();
        assert_eq!(started, json!({"event": "capture_started", "data": {"interface": "eth0"}}));

        let stopped = serde_json::to_value(CaptureEvent::CaptureStopped {}).unwrap();
        assert_eq!(stopped, json!({"event": "capture_stopped", "data": {}}));

        let saved = serde_json::to_value(CaptureEvent::PcapSaved { filename: "live_capture_1.pcap".into(), packet_count: 4 }).unwrap();
        assert_eq!(saved["data"]["packetCount"], 4);
    }

    #[test]
    fn test_channel_sink_survives_closed_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.emit(CaptureEvent::InterfaceReady { interface: "en0".into() });
        assert_eq!(rx.recv().unwrap().name(), "interface_ready");
        drop(rx);
        tx.emit(CaptureEvent::CaptureStopped {});
    }
}
