//! Executor abstraction for directive execution.
//!
//! The agent loop only sees [`Executor`]; the host shell is one implementation
//! and tests substitute canned output.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_captured;

/// Parameters for running one directive.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Shell command line taken from the resource.
    pub directive: String,
    /// Working directory; inherits the agent's when `None`.
    pub workdir: Option<PathBuf>,
    /// Maximum time to wait for the command to complete.
    pub timeout: Duration,
    /// Keep at most this many bytes of output.
    pub output_limit_bytes: usize,
}

/// Captured result of a directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Combined stdout and stderr, lossily decoded.
    pub text: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Abstraction over directive execution backends.
pub trait Executor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput>;
}

/// Runs directives with `sh -c`, stderr merged into stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

impl Executor for ShellExecutor {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        info!(directive = %request.directive, "running directive");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&request.directive);
        if let Some(workdir) = &request.workdir {
            cmd.current_dir(workdir);
        }

        let run = run_captured(cmd, request.timeout, request.output_limit_bytes)
            .context("run directive")?;

        let mut text = String::from_utf8_lossy(&run.output).into_owned();
        text.push_str(&run.notices());
        if run.timed_out {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "directive timed out"
            );
            text.push_str(&format!(
                "\n[command timed out after {}s]\n",
                request.timeout.as_secs()
            ));
        }

        debug!(exit_code = ?run.status.code(), bytes = text.len(), "directive finished");
        Ok(ExecOutput {
            text,
            exit_code: run.status.code(),
            timed_out: run.timed_out,
        })
    }
}

/// Run a directive and always come back with text to commit.
///
/// Spawn and I/O failures become the output text.
pub fn execute_capturing<E: Executor>(executor: &E, request: &ExecRequest) -> String {
    match executor.exec(request) {
        Ok(output) => output.text,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "directive could not be executed");
            format!("relay: failed to execute directive: {err:#}")
        }
    }
}
