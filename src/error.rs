use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("could not read {path}: it might be corrupted or in an unsupported format ({reason})")]
    Decode { path: PathBuf, reason: String },

    #[error("pcap error: {0}")]
    Pcap(#[from] pcap::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("remote capture error: {0}")]
    Transport(String),

    #[error("no active capture")]
    NoActiveSession,

    #[error("capture controller is not running")]
    ControllerGone,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cannot use a capture file, a local interface and a remote host together")]
    ConflictingModes,

    #[error("--remote-host requires --remote-interface")]
    MissingRemoteInterface,

    #[error("--remote-interface requires --remote-host")]
    MissingRemoteHost,

    #[error("file '{0}' not found")]
    FileNotFound(PathBuf),

    #[error("file '{0}' must be .pcap or .pcapng format")]
    UnsupportedFormat(PathBuf),

    #[error("no capture target configured")]
    NoTarget,

    #[error("invalid tuning file: {0}")]
    Tuning(String),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
