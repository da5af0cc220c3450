//! Remote capture over SSH: `tcpdump -w -` on the far side, its stdout
//! decoded here as a pcap stream.

use std::collections::VecDeque;
use std::fmt;
use std::io::{BufRead, BufReader, Cursor, Read, Write};
use std::net::IpAddr;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};
use tracing::{debug, info, warn};

use crate::error::{CaptureError, Result};
use crate::models::domain::RawFrame;
use crate::session::SourceContext;

const PCAP_HEADER_LEN: usize = 24;
const READER_CAPACITY: usize = 1 << 20;
const STDERR_TAIL_LINES: usize = 5;
const SSH_OPTIONS: [&str; 4] = [
    "StrictHostKeyChecking=no",
    "ServerAliveInterval=5",
    "TCPKeepAlive=yes",
    "Compression=no",
];

pub type StderrTail = Arc<Mutex<VecDeque<String>>>;

#[derive(Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// `host` or `user@host`
    pub host: String,
    pub interface: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("host", &self.host)
            .field("interface", &self.interface)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RemoteTarget {
    pub fn host_name(&self) -> &str {
        self.host.rsplit_once('@').map(|(_, host)| host).unwrap_or(&self.host)
    }

    /// What ssh connects to.
    pub fn destination(&self) -> String {
        match &self.username {
            Some(user) if !self.host.contains('@') => format!("{user}@{}", self.host),
            _ => self.host.clone(),
        }
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.host_name(), self.interface)
    }

    /// The command run on the remote host.
    pub fn remote_command(&self) -> String {
        let sudo = if self.password.is_some() { "sudo -S -p ''" } else { "sudo -n" };
        // the tunnel's own traffic stays out of the capture
        let filter = match self.host_name().parse::<IpAddr>() {
            Ok(ip) => format!("not (host {ip} and port 22)"),
            Err(_) => "not port 22".to_string(),
        };
        format!(
            "{sudo} tcpdump -i {} -U -w - --immediate-mode -s 0 {}",
            shell_quote(&self.interface),
            shell_quote(&filter)
        )
    }

    fn command(&self) -> Command {
        let mut command = match &self.password {
            Some(password) => {
                let mut command = Command::new("sshpass");
                command.arg("-e").arg("ssh").env("SSHPASS", password);
                command
            }
            None => {
                let mut command = Command::new("ssh");
                command.args(["-o", "BatchMode=yes"]);
                command
            }
        };
        for option in SSH_OPTIONS {
            command.arg("-o").arg(option);
        }
        command
            .arg("-T")
            .arg(self.destination())
            .arg(self.remote_command())
            .stdin(if self.password.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    /// The launch command as it can be logged.
    pub fn describe_command(&self) -> String {
        let auth = if self.password.is_some() { "SSHPASS=<redacted> sshpass -e ssh" } else { "ssh -o BatchMode=yes" };
        let options: Vec<String> = SSH_OPTIONS.iter().map(|o| format!("-o {o}")).collect();
        format!("{auth} {} -T {} {}", options.join(" "), self.destination(), shell_quote(&self.remote_command()))
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The ssh child process of a remote session.
pub struct RemoteProcess {
    child: Child,
    stderr_tail: StderrTail,
}

impl RemoteProcess {
    pub fn stderr_tail(&self) -> StderrTail {
        Arc::clone(&self.stderr_tail)
    }

    pub fn terminate(&mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(%status, "remote capture process already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "could not poll remote capture process"),
        }
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "could not kill remote capture process");
        }
        match self.child.wait() {
            Ok(status) => debug!(%status, "remote capture process terminated"),
            Err(e) => warn!(error = %e, "could not reap remote capture process"),
        }
    }
}

/// Start ssh and hand back its stdout.
pub fn launch(target: &RemoteTarget) -> Result<(RemoteProcess, ChildStdout)> {
    info!(command = %target.describe_command(), "starting remote capture");
    let mut child = target
        .command()
        .spawn()
        .map_err(|e| CaptureError::Transport(format!("could not launch ssh: {e}")))?;

    let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    if let Some(stderr) = child.stderr.take() {
        let tail = Arc::clone(&stderr_tail);
        if let Err(e) = thread::Builder::new().name("remote-stderr".into()).spawn(move || drain_stderr(stderr, tail)) {
            warn!(error = %e, "could not start stderr reader");
        }
    }

    let mut process = RemoteProcess { child, stderr_tail };

    if let Some(password) = &target.password {
        // sudo -S reads the password from the first line of stdin
        let written = match process.child.stdin.take() {
            Some(mut stdin) => writeln!(stdin, "{password}").and_then(|()| stdin.flush()),
            None => Ok(()),
        };
        if let Err(e) = written {
            process.terminate();
            return Err(CaptureError::Transport(format!("could not send sudo password: {e}")));
        }
    }

    match process.child.stdout.take() {
        Some(stdout) => Ok((process, stdout)),
        None => {
            process.terminate();
            Err(CaptureError::Transport("remote capture has no stdout".into()))
        }
    }
}

fn drain_stderr(stderr: ChildStderr, tail: StderrTail) {
    for line in BufReader::new(stderr).lines().map_while(|line| line.ok()) {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        debug!(%line, "remote stderr");
        let mut lines = tail.lock();
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }
}

/// Source loop for a remote session.
pub fn receive_loop<R: Read>(reader: R, context: &SourceContext, stderr_tail: &StderrTail) {
    let outcome = stream_frames(reader, &context.running, |frame, dlt| context.ingest.accept(frame, dlt));
    let reason = match outcome {
        Ok(count) => format!("remote capture process exited after {count} packets"),
        Err(CaptureError::Transport(reason)) => reason,
        Err(e) => e.to_string(),
    };
    if !context.is_running() {
        debug!(%reason, "remote reader stopped");
        return;
    }

    let tail: Vec<String> = stderr_tail.lock().iter().cloned().collect();
    let message = if tail.is_empty() {
        format!("Remote capture error: {reason}")
    } else {
        format!("Remote capture error: {reason} ({})", tail.join("; "))
    };
    context.fail(message);
}

/// Decode a classic pcap byte stream, calling `on_frame` with every packet
/// and the stream's link type. Returns the packet count at end of stream or
/// once `running` clears.
pub fn stream_frames<R, F>(mut reader: R, running: &AtomicBool, mut on_frame: F) -> Result<u64>
where
    R: Read,
    F: FnMut(RawFrame, i32),
{
    // a pipe can hand back the header in pieces; the pcap reader wants it whole
    let mut header = [0u8; PCAP_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|e| CaptureError::Transport(format!("no pcap header from remote capture: {e}")))?;

    let mut pcap = LegacyPcapReader::new(READER_CAPACITY, Cursor::new(header).chain(reader))
        .map_err(|e| CaptureError::Transport(format!("not a pcap stream: {e:?}")))?;

    let mut dlt = 1;
    let mut nanosecond = false;
    let mut count = 0u64;
    while running.load(Ordering::SeqCst) {
        match pcap.next() {
            Ok((offset, block)) => {
                let frame = match block {
                    PcapBlockOwned::LegacyHeader(header) => {
                        dlt = header.network.0;
                        nanosecond = header.is_nanosecond_precision();
                        debug!(dlt, snaplen = header.snaplen, "remote pcap header");
                        None
                    }
                    PcapBlockOwned::Legacy(packet) => Some(RawFrame {
                        ts_sec: i64::from(packet.ts_sec),
                        ts_usec: if nanosecond {
                            i64::from(packet.ts_usec / 1000)
                        } else {
                            i64::from(packet.ts_usec)
                        },
                        orig_len: packet.origlen,
                        data: packet.data.to_vec(),
                    }),
                    PcapBlockOwned::NG(_) => None,
                };
                pcap.consume(offset);
                if let Some(frame) = frame {
                    count += 1;
                    on_frame(frame, dlt);
                }
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                pcap.refill()
                    .map_err(|e| CaptureError::Transport(format!("remote stream read failed: {e:?}")))?;
            }
            Err(e) => return Err(CaptureError::Transport(format!("corrupt remote pcap stream: {e:?}"))),
        }
    }
    Ok(count)
}
