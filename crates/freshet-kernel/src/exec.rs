//! Shell command execution with bounded output and a hard deadline.
//!
//! Commands run inside the sandbox on behalf of a generation. Output is
//! capped by [`RingBuffer`]s and a timeout converts runaway commands into
//! data, not errors: the caller gets whatever accumulated plus a timeout
//! indicator, never an exception that discards the output.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::ring::RingBuffer;

/// Default retained output per stream (characters).
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 64 * 1024;

/// Default command deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error while reading command output: {0}")]
    Io(#[from] std::io::Error),
}

/// A command to run with its resource bounds.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub max_output_chars: usize,
}

impl ExecRequest {
    /// Create a request with default bounds.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the per-stream output cap.
    pub fn with_max_output(mut self, max_output_chars: usize) -> Self {
        self.max_output_chars = max_output_chars;
        self
    }
}

/// What a command produced, bounded and annotated.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Captured stdout, truncation-marked if the cap was exceeded.
    pub stdout: String,
    /// Captured stderr, truncation-marked if the cap was exceeded.
    pub stderr: String,
    /// Exit code; `None` when killed by signal or deadline.
    pub exit_code: Option<i32>,
    /// Whether the deadline fired.
    pub timed_out: bool,
}

impl ExecOutcome {
    /// Clean zero exit within the deadline.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// Run a command to completion or deadline, capturing capped output.
pub async fn run_command(req: &ExecRequest) -> Result<ExecOutcome, ExecError> {
    let mut child = Command::new(&req.program)
        .args(&req.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            program: req.program.clone(),
            source,
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr not captured"))?;

    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_buf = RingBuffer::new(req.max_output_chars);
    let mut err_buf = RingBuffer::new(req.max_output_chars);

    let waited = tokio::time::timeout(req.timeout, async {
        let mut out_done = false;
        let mut err_done = false;
        while !(out_done && err_done) {
            tokio::select! {
                line = out_lines.next_line(), if !out_done => match line? {
                    Some(line) => {
                        out_buf.append(&line);
                        out_buf.append("\n");
                    }
                    None => out_done = true,
                },
                line = err_lines.next_line(), if !err_done => match line? {
                    Some(line) => {
                        err_buf.append(&line);
                        err_buf.append("\n");
                    }
                    None => err_done = true,
                },
            }
        }
        child.wait().await
    })
    .await;

    match waited {
        Ok(status) => Ok(ExecOutcome {
            stdout: out_buf.to_string(),
            stderr: err_buf.to_string(),
            exit_code: status?.code(),
            timed_out: false,
        }),
        Err(_elapsed) => {
            if let Err(e) = child.kill().await {
                tracing::warn!("failed to kill timed-out command: {e}");
            }
            Ok(ExecOutcome {
                stdout: out_buf.to_string(),
                stderr: err_buf.to_string(),
                exit_code: None,
                timed_out: true,
            })
        }
    }
}
