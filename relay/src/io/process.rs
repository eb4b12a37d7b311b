//! Child processes with a deadline and a bounded, merged output capture.
//!
//! stdout and stderr share one pipe so their interleaving survives. Reading
//! stops shortly after the child exits even if a background grandchild still
//! holds the pipe, since directives like `server &` are common.

use std::io::{self, PipeReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// How long to keep draining after the child has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// What a finished (or killed) child left behind.
#[derive(Debug)]
pub struct CapturedRun {
    pub status: ExitStatus,
    /// Merged stdout and stderr, at most the configured limit.
    pub output: Vec<u8>,
    /// Bytes read past the limit and discarded.
    pub dropped: usize,
    pub timed_out: bool,
    /// The pipe was still open after the child exited.
    pub detached: bool,
}

impl CapturedRun {
    /// Trailer describing what the capture is missing, empty when complete.
    pub fn notices(&self) -> String {
        let mut out = String::new();
        if self.dropped > 0 {
            out.push_str(&format!("\n[output truncated {} bytes]\n", self.dropped));
        }
        if self.detached {
            out.push_str("\n[background process still attached to output; capture stopped]\n");
        }
        out
    }
}

#[derive(Debug)]
struct OutputSink {
    kept: Vec<u8>,
    dropped: usize,
    limit: usize,
}

impl OutputSink {
    fn new(limit: usize) -> Self {
        Self {
            kept: Vec::new(),
            dropped: 0,
            limit,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.kept.len());
        let keep = chunk.len().min(room);
        self.kept.extend_from_slice(&chunk[..keep]);
        self.dropped += chunk.len() - keep;
    }
}

/// Run `cmd` with stdin closed, killing it once `timeout` passes.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, limit))]
pub fn run_captured(mut cmd: Command, timeout: Duration, limit: usize) -> Result<CapturedRun> {
    let (reader, writer) = io::pipe().context("create output pipe")?;
    cmd.stdin(Stdio::null())
        .stdout(writer.try_clone().context("clone output pipe")?)
        .stderr(writer);

    let mut child = cmd.spawn().context("spawn command")?;
    // `cmd` still owns write ends of the pipe; EOF never arrives while they live.
    drop(cmd);
    debug!(pid = child.id(), "child spawned");

    let sink = Arc::new(Mutex::new(OutputSink::new(limit)));
    let (done_tx, done_rx) = mpsc::channel();
    {
        let sink = Arc::clone(&sink);
        thread::spawn(move || {
            let _ = done_tx.send(drain(reader, &sink));
        });
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let detached = match done_rx.recv_timeout(DRAIN_GRACE) {
        Ok(result) => {
            result?;
            false
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!("output pipe still open after exit, stopped reading");
            true
        }
        Err(RecvTimeoutError::Disconnected) => {
            return Err(anyhow!("output reader thread panicked"));
        }
    };

    let sink = sink.lock().map_err(|_| anyhow!("output buffer poisoned"))?;
    if sink.dropped > 0 {
        warn!(dropped = sink.dropped, "output truncated");
    }
    debug!(exit_code = ?status.code(), timed_out, detached, "command finished");
    Ok(CapturedRun {
        status,
        output: sink.kept.clone(),
        dropped: sink.dropped,
        timed_out,
        detached,
    })
}

fn drain(mut reader: PipeReader, sink: &Mutex<OutputSink>) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        sink.lock()
            .map_err(|_| anyhow!("output buffer poisoned"))?
            .push(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn sink_counts_bytes_past_limit() {
        let mut sink = OutputSink::new(4);
        sink.push(b"01");
        sink.push(b"23456789");
        assert_eq!(sink.kept, b"0123");
        assert_eq!(sink.dropped, 6);
    }

    #[cfg(unix)]
    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[cfg(unix)]
    #[test]
    fn merges_streams_in_order() {
        let run = run_captured(
            sh("echo out; echo err >&2; echo again; exit 3"),
            Duration::from_secs(5),
            1_000,
        )
        .expect("run");
        assert_eq!(run.output, b"out\nerr\nagain\n");
        assert_eq!(run.status.code(), Some(3));
        assert!(!run.timed_out);
        assert_eq!(run.notices(), "");
    }

    #[cfg(unix)]
    #[test]
    fn kills_command_after_timeout() {
        let run = run_captured(sh("exec sleep 5"), Duration::from_millis(200), 1_000).expect("run");
        assert!(run.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn stdin_is_closed() {
        let run = run_captured(sh("cat; echo end"), Duration::from_secs(5), 1_000).expect("run");
        assert_eq!(run.output, b"end\n");
    }

    #[cfg(unix)]
    #[test]
    fn background_child_does_not_block_capture() {
        let started = Instant::now();
        let run = run_captured(sh("sleep 3 & echo started"), Duration::from_secs(5), 1_000)
            .expect("run");
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert!(run.detached);
        assert_eq!(run.output, b"started\n");
        assert!(run.notices().contains("background process"));
    }
}
