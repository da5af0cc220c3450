//! Session archives: raw frames written to pcap files on stop, with
//! rotation that keeps the newest few files per capture key.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use multimap::MultiMap;
use pcap::{Capture, Linktype, Packet, PacketHeader};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CaptureError, Result};
use crate::models::domain::RawFrame;

const LIVE_PREFIX: &str = "live_capture";
const EXTENSION: &str = "pcap";
const DLT_EN10MB: i32 = 1;

/// Raw frames collected for the archive while a session runs.
#[derive(Debug)]
pub struct ArchiveTap {
    frames: Vec<RawFrame>,
    dlt: Option<i32>,
    limit: usize,
    overflow: u64,
}

impl ArchiveTap {
    pub fn new(limit: usize) -> Self {
        ArchiveTap { frames: Vec::new(), dlt: None, limit, overflow: 0 }
    }

    pub fn push(&mut self, frame: RawFrame, dlt: i32) {
        self.dlt.get_or_insert(dlt);
        if self.frames.len() >= self.limit {
            self.overflow += 1;
            if self.overflow == 1 {
                warn!(limit = self.limit, "archive limit reached, later frames will not be saved");
            }
            return;
        }
        self.frames.push(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    /// Drain the tap: frames plus the link type they were captured with.
    pub fn take(&mut self) -> (Vec<RawFrame>, i32) {
        (std::mem::take(&mut self.frames), self.dlt.unwrap_or(DLT_EN10MB))
    }
}

/// Naming scheme for one session's archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveName {
    Live,
    Remote { host: String, interface: String },
}

impl ArchiveName {
    pub fn rotation_key(&self) -> String {
        match self {
            ArchiveName::Live => LIVE_PREFIX.to_string(),
            ArchiveName::Remote { host, interface } => format!("{}-{}", sanitize(host), sanitize(interface)),
        }
    }

    fn stem(&self, unix_secs: i64) -> String {
        match self {
            ArchiveName::Live => format!("{LIVE_PREFIX}_{unix_secs}"),
            ArchiveName::Remote { .. } => format!("{}-{unix_secs}", self.rotation_key()),
        }
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '_' })
        .collect()
}

/// Rotation key of an archive file name, `None` for files we did not write.
pub fn rotation_key(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(".pcap")?;
    if let Some(stamp) = stem.strip_prefix("live_capture_") {
        return is_stamp(stamp).then(|| LIVE_PREFIX.to_string());
    }
    let (key, stamp) = stem.rsplit_once('-')?;
    (key.contains('-') && is_stamp(stamp)).then(|| key.to_string())
}

// "<digits>" or "<digits>_<digits>"
fn is_stamp(s: &str) -> bool {
    let all_digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    match s.split_once('_') {
        Some((secs, n)) => all_digits(secs) && all_digits(n),
        None => all_digits(s),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedCapture {
    pub path: PathBuf,
    pub filename: String,
    pub packet_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureFileInfo {
    pub filename: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub rotation_key: Option<String>,
    pub packet_count: Option<u64>,
    pub first_timestamp: Option<f64>,
    pub last_timestamp: Option<f64>,
}

#[derive(Debug, Clone)]
struct StoredCapture {
    path: PathBuf,
    modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    dir: PathBuf,
    keep: usize,
}

impl ArchiveWriter {
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        ArchiveWriter { dir: dir.into(), keep: keep.max(1) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `frames` to a new file and rotate its key. `Ok(None)` when
    /// there was nothing to write. A rotation failure is logged, not returned.
    pub fn save(&self, name: &ArchiveName, dlt: i32, frames: &[RawFrame]) -> Result<Option<SavedCapture>> {
        if frames.is_empty() {
            debug!("no frames captured, nothing to archive");
            return Ok(None);
        }
        fs::create_dir_all(&self.dir)?;

        let path = self.unused_path(&name.stem(Utc::now().timestamp()));
        write_pcap(&path, dlt, frames)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(file = %path.display(), packets = frames.len(), "capture archived");

        match self.rotate(&name.rotation_key(), &path) {
            Ok(removed) if !removed.is_empty() => info!(removed = removed.len(), "rotated old captures"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "capture rotation failed"),
        }

        Ok(Some(SavedCapture { path, filename, packet_count: frames.len() }))
    }

    fn unused_path(&self, stem: &str) -> PathBuf {
        let mut path = self.dir.join(format!("{stem}.{EXTENSION}"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{stem}_{n}.{EXTENSION}"));
            n += 1;
        }
        path
    }

    /// Delete all but the `keep` newest files for `key`. `retain` always
    /// survives and counts toward `keep`. Returns the deleted paths.
    pub fn rotate(&self, key: &str, retain: &Path) -> Result<Vec<PathBuf>> {
        let mut grouped = self.scan()?;
        let Some(mut files) = grouped.remove(key) else {
            return Ok(Vec::new());
        };
        files.retain(|f| f.path != retain);
        // newest first; names carry the timestamp, so they break mtime ties
        files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));

        let mut removed = Vec::new();
        for stale in files.into_iter().skip(self.keep - 1) {
            match fs::remove_file(&stale.path) {
                Ok(()) => {
                    debug!(file = %stale.path.display(), "removed old capture");
                    removed.push(stale.path);
                }
                Err(e) => warn!(file = %stale.path.display(), error = %e, "could not remove old capture"),
            }
        }
        Ok(removed)
    }

    fn scan(&self) -> Result<MultiMap<String, StoredCapture>> {
        let mut grouped = MultiMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(key) = rotation_key(&name) else { continue };
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            grouped.insert(key, StoredCapture { path: entry.path(), modified: meta.modified()? });
        }
        Ok(grouped)
    }

    /// Every capture file in the archive directory, newest first.
    pub fn catalog(&self) -> Result<Vec<CaptureFileInfo>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut listing = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_capture = Path::new(&name)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("pcap") || e.eq_ignore_ascii_case("pcapng"))
                .unwrap_or(false);
            if !is_capture {
                continue;
            }
            let meta = entry.metadata()?;
            let (packet_count, first_timestamp, last_timestamp) = match summarize(&entry.path()) {
                Ok((count, first, last)) => (Some(count), first, last),
                Err(e) => {
                    debug!(file = %name, error = %e, "unreadable capture in catalog");
                    (None, None, None)
                }
            };
            listing.push(CaptureFileInfo {
                rotation_key: rotation_key(&name),
                filename: name,
                size: meta.len(),
                modified: DateTime::<Utc>::from(meta.modified()?),
                packet_count,
                first_timestamp,
                last_timestamp,
            });
        }
        listing.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.filename.cmp(&a.filename)));
        Ok(listing)
    }
}

fn write_pcap(path: &Path, dlt: i32, frames: &[RawFrame]) -> Result<()> {
    let capture = Capture::dead(Linktype(dlt))?;
    let mut savefile = capture.savefile(path)?;
    for frame in frames {
        let header = PacketHeader {
            ts: libc::timeval { tv_sec: frame.ts_sec as _, tv_usec: frame.ts_usec as _ },
            caplen: frame.data.len() as u32,
            len: frame.orig_len.max(frame.data.len() as u32),
        };
        savefile.write(&Packet::new(&header, &frame.data));
    }
    savefile.flush()?;
    Ok(())
}

fn summarize(path: &Path) -> Result<(u64, Option<f64>, Option<f64>)> {
    let mut capture = Capture::from_file(path)?;
    let mut count = 0;
    let mut first = None;
    let mut last = None;
    loop {
        match capture.next_packet() {
            Ok(packet) => {
                let ts = RawFrame::from_pcap(&packet).timestamp();
                count += 1;
                first.get_or_insert(ts);
                last = Some(ts);
            }
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => return Err(CaptureError::Pcap(e)),
        }
    }
    Ok((count, first, last))
}
