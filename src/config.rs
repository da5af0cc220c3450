use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::filter::VisibilityPolicy;
use crate::remote::RemoteTarget;
use crate::session::{CaptureTarget, SessionOptions};

#[derive(Debug, Parser)]
#[command(name = "sniff-graph", version, about = "Turn captured traffic into a live host/flow graph")]
pub struct Cli {
    /// Capture file to analyze (.pcap or .pcapng)
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Local network interface for live capture (e.g. eth0, en0)
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Capture file to play through the live pipeline
    #[arg(long, value_name = "FILE")]
    pub replay: Option<PathBuf>,

    /// Remote host to capture from over SSH ([user@]host)
    #[arg(long, visible_alias = "rhost")]
    pub remote_host: Option<String>,

    /// Interface on the remote host
    #[arg(long, visible_alias = "rif")]
    pub remote_interface: Option<String>,

    #[arg(long, visible_alias = "ruser")]
    pub remote_user: Option<String>,

    /// SSH/sudo password for the remote host
    #[arg(long, visible_alias = "rpass", env = "SNIFF_REMOTE_PASSWORD", hide_env_values = true)]
    pub remote_password: Option<String>,

    /// Disable reverse DNS resolution
    #[arg(short, long)]
    pub no_dns: bool,

    /// Show only IPv4 addresses
    #[arg(long)]
    pub ipv4_only: bool,

    /// Show only private addresses
    #[arg(long)]
    pub private_only: bool,

    /// Port handed to the delivery layer
    #[arg(short, long, default_value_t = 5001)]
    pub port: u16,

    /// Where finished captures are archived
    #[arg(long, default_value = "uploads")]
    pub capture_dir: PathBuf,

    /// JSON file overriding pipeline tuning
    #[arg(long)]
    pub tuning: Option<PathBuf>,

    /// Print capture-capable interfaces and exit
    #[arg(long)]
    pub list_interfaces: bool,

    /// Print the archived capture catalog and exit
    #[arg(long)]
    pub list_captures: bool,

    #[arg(long)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTuning {
    pub interval_ms: u64,
    pub max_packets: usize,
    pub buffer_capacity: usize,
}

impl BatchTuning {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsTuning {
    pub tick_ms: u64,
    pub per_tick: usize,
    pub timeout_ms: u64,
}

impl DnsTuning {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for DnsTuning {
    fn default() -> Self {
        DnsTuning { tick_ms: 1000, per_tick: 5, timeout_ms: 2000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineTuning {
    pub live: BatchTuning,
    pub remote: BatchTuning,
    pub dns: DnsTuning,
    pub stop_timeout_ms: u64,
    pub archive_keep: usize,
    pub archive_frame_limit: usize,
}

impl PipelineTuning {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Tuning(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Tuning(format!("{}: {e}", path.display())))
    }
}

impl Default for PipelineTuning {
    fn default() -> Self {
        PipelineTuning {
            live: BatchTuning { interval_ms: 2000, max_packets: 500, buffer_capacity: 5000 },
            remote: BatchTuning { interval_ms: 5000, max_packets: 100, buffer_capacity: 1000 },
            dns: DnsTuning::default(),
            stop_timeout_ms: 2000,
            archive_keep: 3,
            archive_frame_limit: 200_000,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Mode {
    Offline(PathBuf),
    Capture(CaptureTarget),
    /// No target yet; sessions are started through the controller.
    Idle,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub resolve_dns: bool,
    pub policy: VisibilityPolicy,
    pub port: u16,
    pub capture_dir: PathBuf,
    pub tuning: PipelineTuning,
    pub debug: bool,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let selected = [cli.file.is_some(), cli.interface.is_some(), cli.remote_host.is_some(), cli.replay.is_some()]
            .iter()
            .filter(|set| **set)
            .count();
        if selected > 1 {
            return Err(ConfigError::ConflictingModes);
        }

        let mode = match (cli.file, cli.interface, cli.remote_host, cli.remote_interface, cli.replay) {
            (Some(file), ..) => {
                validate_capture_file(&file)?;
                Mode::Offline(file)
            }
            (None, None, None, None, Some(path)) => {
                validate_capture_file(&path)?;
                Mode::Capture(CaptureTarget::Replay { path })
            }
            (None, Some(interface), None, _, None) => Mode::Capture(CaptureTarget::Local { interface }),
            (None, None, Some(host), Some(interface), None) => Mode::Capture(CaptureTarget::Remote(RemoteTarget {
                host,
                interface,
                username: cli.remote_user,
                password: cli.remote_password,
            })),
            (None, None, Some(_), None, _) => return Err(ConfigError::MissingRemoteInterface),
            (None, None, None, Some(_), _) => return Err(ConfigError::MissingRemoteHost),
            _ => Mode::Idle,
        };

        let tuning = match cli.tuning {
            Some(path) => PipelineTuning::load(&path)?,
            None => PipelineTuning::default(),
        };

        Ok(Config {
            mode,
            resolve_dns: !cli.no_dns,
            policy: VisibilityPolicy { ipv4_only: cli.ipv4_only, private_only: cli.private_only },
            port: cli.port,
            capture_dir: cli.capture_dir,
            tuning,
            debug: cli.debug,
        })
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions { resolve_dns: self.resolve_dns, policy: self.policy, tuning: self.tuning }
    }
}

fn validate_capture_file(path: &Path) -> Result<(), ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }
    let supported = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("pcap") || ext.eq_ignore_ascii_case("pcapng"))
        .unwrap_or(false);
    if !supported {
        return Err(ConfigError::UnsupportedFormat(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let mut argv = vec!["sniff-graph"];
        argv.extend_from_slice(args);
        Config::from_cli(Cli::parse_from(argv))
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();
        assert!(matches!(config.mode, Mode::Idle));
        assert!(config.resolve_dns);
        assert_eq!(config.port, 5001);
        assert_eq!(config.tuning.live.buffer_capacity, 5000);
        assert_eq!(config.tuning.remote.interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_conflicting_modes() {
        assert_eq!(parse(&["-i", "eth0", "--rhost", "box"]).unwrap_err(), ConfigError::ConflictingModes);
    }

    #[test]
    fn test_remote_pair_required() {
        assert_eq!(parse(&["--remote-host", "box"]).unwrap_err(), ConfigError::MissingRemoteInterface);
        assert_eq!(parse(&["--rif", "eth0"]).unwrap_err(), ConfigError::MissingRemoteHost);

        let config = parse(&["--rhost", "box", "--rif", "eth1", "--ruser", "ops", "-n", "--private-only"]).unwrap();
        match config.mode {
            Mode::Capture(CaptureTarget::Remote(target)) => {
                assert_eq!(target.host, "box");
                assert_eq!(target.interface, "eth1");
                assert_eq!(target.username.as_deref(), Some("ops"));
            }
            other => panic!("unexpected mode {other:?}"),
        }
        assert!(!config.resolve_dns);
        assert!(config.policy.private_only);
    }

    #[test]
    fn test_offline_file_checks() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.pcap");
        assert!(matches!(
            parse(&["-f", missing.to_str().unwrap()]).unwrap_err(),
            ConfigError::FileNotFound(_)
        ));

        let text = dir.path().join("notes.txt");
        fs::write(&text, b"hello").unwrap();
        assert!(matches!(
            parse(&["-f", text.to_str().unwrap()]).unwrap_err(),
            ConfigError::UnsupportedFormat(_)
        ));

        let capture = dir.path().join("trace.PCAP");
        fs::write(&capture, b"").unwrap();
        assert!(matches!(parse(&["-f", capture.to_str().unwrap()]).unwrap().mode, Mode::Offline(_)));
        assert!(matches!(
            parse(&["--replay", capture.to_str().unwrap()]).unwrap().mode,
            Mode::Capture(CaptureTarget::Replay { .. })
        ));
        assert_eq!(
            parse(&["--replay", capture.to_str().unwrap(), "-i", "eth0"]).unwrap_err(),
            ConfigError::ConflictingModes
        );
    }

    #[test]
    fn test_partial_tuning_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tuning.json");
        fs::write(&path, r#"{"archiveKeep": 5, "live": {"intervalMs": 250, "maxPackets": 50, "bufferCapacity": 10}}"#).unwrap();
        let tuning = PipelineTuning::load(&path).unwrap();
        assert_eq!(tuning.archive_keep, 5);
        assert_eq!(tuning.live.max_packets, 50);
        assert_eq!(tuning.remote, PipelineTuning::default().remote);

        fs::write(&path, "not json").unwrap();
        assert!(matches!(PipelineTuning::load(&path), Err(ConfigError::Tuning(_))));
    }
}
