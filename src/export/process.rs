//! Encoder subprocess handling
//!
//! Wraps a spawned ffmpeg process: optional piped stdin, background tasks
//! that keep stdout and stderr drained, and exit handling that turns a
//! non-zero status into an [`ExportError::EncoderExit`] carrying the tail of
//! stderr.

use crate::config::log_commands_enabled;
use crate::export::command::{EncoderInvocation, InputMode};
use crate::export::types::ExportError;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

/// Lines of encoder stderr kept for error reports
const STDERR_TAIL_LINES: usize = 200;

#[derive(Debug, Default)]
struct EncoderCounts {
    live: AtomicUsize,
    peak: AtomicUsize,
    spawned: AtomicU64,
}

/// Counts encoder processes started through this crate.
///
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct EncoderTracker {
    counts: Arc<EncoderCounts>,
}

impl EncoderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoders spawned and not yet reaped
    pub fn live(&self) -> usize {
        self.counts.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live encoders
    pub fn peak(&self) -> usize {
        self.counts.peak.load(Ordering::SeqCst)
    }

    /// Total encoders spawned
    pub fn spawned(&self) -> u64 {
        self.counts.spawned.load(Ordering::SeqCst)
    }

    fn register(&self) -> LiveEncoder {
        let live = self.counts.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counts.peak.fetch_max(live, Ordering::SeqCst);
        self.counts.spawned.fetch_add(1, Ordering::SeqCst);
        LiveEncoder {
            counts: Arc::clone(&self.counts),
        }
    }
}

/// Decrements the live count when the process is reaped or dropped
#[derive(Debug)]
struct LiveEncoder {
    counts: Arc<EncoderCounts>,
}

impl Drop for LiveEncoder {
    fn drop(&mut self) {
        self.counts.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A running encoder
#[derive(Debug)]
pub struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    program: String,
    stdout_drain: Option<JoinHandle<()>>,
    stderr_drain: Option<JoinHandle<String>>,
    exit: Option<ExitStatus>,
    live: Option<LiveEncoder>,
}

impl EncoderProcess {
    /// Spawn the encoder described by `invocation`.
    ///
    /// The process is killed if this handle is dropped before it exits.
    pub fn spawn(
        invocation: &EncoderInvocation,
        quiet: bool,
        tracker: &EncoderTracker,
    ) -> Result<Self, ExportError> {
        let program = invocation.program.to_string_lossy().to_string();
        if log_commands_enabled() {
            tracing::info!("Running: {}", invocation.command_line());
        } else {
            tracing::debug!("Running: {}", invocation.command_line());
        }

        let stdin = match invocation.input_mode {
            InputMode::Pipe => Stdio::piped(),
            InputMode::File => Stdio::null(),
        };

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExportError::EncoderSpawn {
                program: program.clone(),
                source,
            })?;

        let live = tracker.register();
        let stdin = child.stdin.take();

        // Both pipes must be drained or the encoder blocks once a buffer fills
        let stdout_drain = child.stdout.take().map(|stdout| {
            tokio::spawn(async move {
                forward_lines(stdout, quiet, 0).await;
            })
        });
        let stderr_drain = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let tail = forward_lines(stderr, quiet, STDERR_TAIL_LINES).await;
                Vec::from(tail).join("\n")
            })
        });

        tracing::debug!("Encoder started (pid {:?})", child.id());

        Ok(Self {
            child,
            stdin,
            program,
            stdout_drain,
            stderr_drain,
            exit: None,
            live: Some(live),
        })
    }

    /// Exit status if the encoder has already exited
    pub fn try_exited(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit = Some(status);
            }
        }
        self.exit
    }

    /// Whether stdin is still open and the encoder still running
    pub fn is_writable(&mut self) -> bool {
        self.stdin.is_some() && self.try_exited().is_none()
    }

    /// Write bytes to the encoder's stdin.
    ///
    /// A closed pipe or an exited encoder yields `SessionNotWritable`.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ExportError> {
        if let Some(status) = self.try_exited() {
            return Err(ExportError::SessionNotWritable(format!(
                "encoder already exited ({status})"
            )));
        }

        let stdin = self.stdin.as_mut().ok_or_else(|| {
            ExportError::SessionNotWritable("encoder input is closed".to_string())
        })?;

        stdin.write_all(bytes).await.map_err(|e| {
            tracing::debug!("Encoder input rejected write: {}", e);
            ExportError::SessionNotWritable(format!("encoder stopped accepting input: {e}"))
        })
    }

    /// Close stdin, signalling end of input
    pub fn close_input(&mut self) {
        if self.stdin.take().is_some() {
            tracing::debug!("Closed encoder input");
        }
    }

    /// Close stdin and wait for the encoder to exit.
    ///
    /// With a `timeout`, an encoder that is still running when it elapses is
    /// killed and `EncoderTimeout` is returned.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<(), ExportError> {
        self.close_input();

        let status = match self.exit {
            Some(status) => status,
            None => match timeout {
                Some(limit) => match tokio::time::timeout(limit, self.child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        tracing::warn!("Encoder still running after {:?}, killing it", limit);
                        self.kill().await;
                        return Err(ExportError::EncoderTimeout(limit));
                    }
                },
                None => self.child.wait().await?,
            },
        };
        self.exit = Some(status);

        if let Some(handle) = self.stdout_drain.take() {
            let _ = handle.await;
        }
        let stderr = match self.stderr_drain.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        self.live.take();

        if status.success() {
            tracing::debug!("Encoder exited cleanly");
            Ok(())
        } else {
            Err(ExportError::EncoderExit {
                status: status.code(),
                stderr,
            })
        }
    }

    /// Kill the encoder and reap it
    pub async fn kill(&mut self) {
        self.close_input();
        if let Err(e) = self.child.kill().await {
            tracing::warn!("Failed to kill encoder {}: {}", self.program, e);
        }
        if let Some(handle) = self.stdout_drain.take() {
            handle.abort();
        }
        if let Some(handle) = self.stderr_drain.take() {
            handle.abort();
        }
        self.live.take();
    }
}

/// Spawn an encoder that reads from files and wait for it to finish
pub async fn run_to_completion(
    invocation: &EncoderInvocation,
    quiet: bool,
    tracker: &EncoderTracker,
) -> Result<(), ExportError> {
    let mut process = EncoderProcess::spawn(invocation, quiet, tracker)?;
    process.wait(None).await
}

/// Read `reader` line by line, forwarding to the log unless `quiet`.
/// Returns the last `keep` lines.
async fn forward_lines<R>(reader: R, quiet: bool, keep: usize) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(keep);
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !quiet {
                    tracing::info!(target: "sketch_export::encoder", "{}", line);
                }
                if keep == 0 {
                    continue;
                }
                if tail.len() == keep {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Stopped reading encoder output: {}", e);
                break;
            }
        }
    }

    tail
}
