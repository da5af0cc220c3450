// src/sniff.rs
use pcap::{Active, Capture, Device};
use tracing::{debug, info};

use crate::error::Result;
use crate::models::domain::RawFrame;
use crate::session::SourceContext;

const SNAPLEN: i32 = 65535;
const READ_TIMEOUT_MS: i32 = 500;

pub fn open_interface(interface: &str) -> Result<Capture<Active>> {
    let capture = Capture::from_device(interface)?
        .promisc(true)
        .snaplen(SNAPLEN)
        .timeout(READ_TIMEOUT_MS)  // wake up to check the running flag
        .immediate_mode(true)
        .open()?;
    info!(interface, datalink = ?capture.get_datalink(), "interface opened");
    Ok(capture)
}

/// Names of capture-capable interfaces.
pub fn list_interfaces() -> Result<Vec<String>> {
    Ok(Device::list()?.into_iter().map(|device| device.name).collect())
}

pub fn capture_loop(mut capture: Capture<Active>, context: &SourceContext) {
    let dlt = capture.get_datalink().0;
    while context.is_running() {
        match capture.next_packet() {
            Ok(packet) => context.ingest.accept(RawFrame::from_pcap(&packet), dlt),
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                context.fail(format!("Capture error: {e}"));
                break;
            }
        }
    }
    debug!("live capture loop exited");
}
