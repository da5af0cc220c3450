use std::path::Path;

use pcap::{Capture, Offline};
use tracing::{debug, info};

use crate::error::{CaptureError, Result};
use crate::models::domain::RawFrame;
use crate::session::SourceContext;

pub fn open(path: &Path) -> Result<Capture<Offline>> {
    Capture::from_file(path).map_err(|e| CaptureError::Decode { path: path.to_path_buf(), reason: e.to_string() })
}

/// Feed a stored capture through a live session. The session keeps running
/// at end of file so the dispatcher can drain what is buffered.
pub fn replay_loop(mut capture: Capture<Offline>, context: &SourceContext) {
    let dlt = capture.get_datalink().0;
    let mut frames = 0u64;
    while context.is_running() {
        match capture.next_packet() {
            Ok(packet) => {
                context.ingest.accept(RawFrame::from_pcap(&packet), dlt);
                frames += 1;
            }
            Err(pcap::Error::NoMorePackets) => {
                info!(frames, "replay reached end of file");
                return;
            }
            Err(e) => {
                context.fail(format!("Replay error: {e}"));
                return;
            }
        }
    }
    debug!(frames, "replay stopped early");
}
