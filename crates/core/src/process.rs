//! Streaming execution of playbook processes.
//!
//! [`ProcessRunner::run`] spawns one child per call and hands back an
//! [`OutputLines`] stream. stdout and stderr are read by two tasks that feed a
//! single channel, so lines surface as soon as the child writes them while the
//! order within each stream is preserved.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::command::CommandSpec;

/// Number of trailing output lines kept for failure reports.
pub const OUTPUT_TAIL_LINES: usize = 20;

/// Capacity of the line channel between the reader tasks and the consumer.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Errors from process execution.
///
/// Carries plain data only so it can cross task and queue boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessError {
    #[error("Process exited with code {exit_code}")]
    Failed {
        exit_code: i32,
        output_tail: Vec<String>,
    },

    #[error("Process timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Process I/O error: {message}")]
    Io { message: String },
}

impl From<std::io::Error> for ProcessError {
    fn from(err: std::io::Error) -> Self {
        ProcessError::Io {
            message: err.to_string(),
        }
    }
}

/// Spawns child processes with a wall-clock limit.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Start `spec` and return its output stream.
    ///
    /// The child inherits the current environment with `spec.environment`
    /// layered on top. It is killed if the returned stream is dropped.
    pub fn run(&self, spec: &CommandSpec) -> Result<OutputLines, ProcessError> {
        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.arguments)
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        let mut child = cmd.spawn()?;

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        tracing::debug!(
            command = %spec.display_line(),
            pid = child.id(),
            "Spawned playbook process",
        );

        Ok(OutputLines {
            child,
            rx,
            started,
            deadline: started + self.timeout,
            tail: VecDeque::with_capacity(OUTPUT_TAIL_LINES),
            finished: false,
        })
    }
}

/// Line stream of one running child process.
#[derive(Debug)]
pub struct OutputLines {
    child: Child,
    rx: mpsc::Receiver<String>,
    started: Instant,
    deadline: Instant,
    tail: VecDeque<String>,
    finished: bool,
}

impl OutputLines {
    /// Wait for the next output line.
    ///
    /// Returns `Ok(None)` once both streams are closed and the child exited
    /// with code 0. A non-zero exit yields [`ProcessError::Failed`]; passing
    /// the deadline kills the child and yields [`ProcessError::Timeout`].
    /// After the first `Ok(None)` or error, every further call returns
    /// `Ok(None)`.
    pub async fn next_line(&mut self) -> Result<Option<String>, ProcessError> {
        if self.finished {
            return Ok(None);
        }

        match tokio::time::timeout_at(self.deadline, self.rx.recv()).await {
            Ok(Some(line)) => {
                if self.tail.len() == OUTPUT_TAIL_LINES {
                    self.tail.pop_front();
                }
                self.tail.push_back(line.clone());
                Ok(Some(line))
            }
            Ok(None) => {
                self.finished = true;
                let status = match tokio::time::timeout_at(self.deadline, self.child.wait()).await
                {
                    Ok(status) => status?,
                    Err(_) => return Err(self.kill_for_timeout().await),
                };
                self.check_status(status)
            }
            Err(_) => {
                self.finished = true;
                Err(self.kill_for_timeout().await)
            }
        }
    }

    /// Milliseconds since the child was spawned.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn check_status(&mut self, status: ExitStatus) -> Result<Option<String>, ProcessError> {
        if status.success() {
            return Ok(None);
        }
        Err(ProcessError::Failed {
            exit_code: status.code().unwrap_or(-1),
            output_tail: self.tail.drain(..).collect(),
        })
    }

    async fn kill_for_timeout(&mut self) -> ProcessError {
        if let Err(err) = self.child.kill().await {
            tracing::warn!(error = %err, "Failed to kill timed out process");
        }
        ProcessError::Timeout {
            elapsed_ms: self.elapsed_ms(),
        }
    }
}

/// Forward every line of `stream` to `tx` until EOF or the receiver is gone.
///
/// Invalid UTF-8 is replaced rather than dropped; line terminators are
/// stripped.
async fn forward_lines<R: AsyncRead + Unpin>(stream: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read process output");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
