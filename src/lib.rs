//! Packet capture aggregation: decode frames from a capture file, a local
//! interface or an SSH-tunnelled remote tcpdump, fold them into a host/flow
//! graph, flag suspicious traffic and deliver the result in periodic batches.

pub mod aggregate;
pub mod archive;
pub mod buffer;
pub mod config;
pub mod control;
pub mod detection;
pub mod dispatch;
pub mod dns;
pub mod error;
pub mod events;
pub mod filter;
pub mod models;
pub mod offline;
pub mod parser;
pub mod pipeline;
pub mod protocol;
pub mod remote;
pub mod replay;
pub mod session;
pub mod sniff;

pub use control::{Controller, ControllerHandle};
pub use error::{CaptureError, ConfigError, Result};
pub use events::{CaptureEvent, EventSink};
pub use session::{CaptureSession, CaptureTarget, SessionEnv, SessionOptions};
