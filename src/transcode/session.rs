//! Transcoder sessions: one child process per request, supervised from spawn to reap.
//!
//! Each session runs three cooperating units:
//! - the input feeder, forwarding PCM chunks into the child's stdin and closing it at end of input
//! - the supervisor, reading the child's stdout into a bounded channel of encoded chunks
//! - the stderr collector, keeping a short tail for error messages
//!
//! The supervisor owns the child. Whatever ends the session (output exhausted, child failure,
//! consumer gone, deadline, shutdown) it finishes with the same cleanup: cancel the feeder,
//! kill the child if it is still running and reap it.
//!
//! Deadline and shutdown are also exposed to the consumer through [`Interruption`], so a
//! consumer blocked on its own sink can stop without waiting for the session.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::command::TranscoderCommand;
use crate::error::PipelineError;
use crate::tts::PcmStream;

/// Compressed audio read from the transcoder, consumed exactly once by the relay.
pub type EncodedChunk = Bytes;

/// Bytes of stderr kept for error reports.
const STDERR_TAIL: usize = 2048;

/// Lifecycle of one transcoder process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Spawn requested
    Starting,
    /// Input is being forwarded while output is read
    Running,
    /// Input closed; remaining output is still being delivered
    Draining,
    /// Output exhausted and process exited (or the consumer went away)
    Closed,
    /// Process failed, a pipe failed, or the session was cancelled
    Errored,
}

/// Process counters, shared by all sessions of one [`Transcoder`].
#[derive(Debug, Default)]
pub struct TranscoderStats {
    spawned: AtomicUsize,
    active: AtomicUsize,
}

impl TranscoderStats {
    /// Processes spawned since startup.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Processes spawned and not yet reaped.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Counts a process as active until the supervisor has reaped it.
struct ActiveProcess(Arc<TranscoderStats>);

impl ActiveProcess {
    fn register(stats: &Arc<TranscoderStats>) -> Self {
        stats.spawned.fetch_add(1, Ordering::SeqCst);
        stats.active.fetch_add(1, Ordering::SeqCst);
        Self(stats.clone())
    }
}

impl Drop for ActiveProcess {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-session buffering and deadline settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub output_capacity: usize,    // Encoded chunks buffered ahead of the relay
    pub read_size: usize,          // Bytes requested per stdout read
    pub timeout: Option<Duration>, // Deadline for the whole session
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { output_capacity: 4, read_size: 16 * 1024, timeout: None }
    }
}

/// Spawns transcoder sessions from one command line.
#[derive(Debug)]
pub struct Transcoder {
    command: TranscoderCommand,
    options: SessionOptions,
    stats: Arc<TranscoderStats>,
}

impl Transcoder {
    pub fn new(command: TranscoderCommand, options: SessionOptions) -> Self {
        Self { command, options, stats: Arc::new(TranscoderStats::default()) }
    }

    pub fn stats(&self) -> &Arc<TranscoderStats> {
        &self.stats
    }

    /// Resolve the executable before any work is started for a request.
    ///
    /// # Errors
    /// Returns [`PipelineError::Spawn`] if the executable cannot be located.
    pub fn preflight(&self) -> Result<std::path::PathBuf, PipelineError> {
        self.command.resolve()
    }

    /// Spawn a transcoder fed by `pcm`.
    ///
    /// # Arguments
    /// * `program` - Executable resolved by [`Transcoder::preflight`]
    /// * `pcm` - PCM chunks to forward into the process
    /// * `shutdown` - Cancelled on server shutdown
    ///
    /// # Errors
    /// Returns [`PipelineError::Spawn`] if the process cannot be launched.
    pub fn open(&self, program: &Path, pcm: PcmStream, shutdown: CancellationToken) -> Result<TranscoderSession, PipelineError> {
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let interruption = Interruption { shutdown: shutdown.clone(), deadline: self.options.timeout.map(|t| Instant::now() + t) };
        // Stops this session only: cancelled by shutdown, by cleanup and by dropping the session.
        let cancel = shutdown.child_token();

        let mut child = Command::new(program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Spawn(format!("failed to launch '{}': {}", program.display(), e)))?;
        let active = ActiveProcess::register(&self.stats);

        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take()) else {
            return Err(PipelineError::Spawn("transcoder pipes are unavailable".to_string()));
        };

        debug!("Spawned transcoder {} (pid {:?})", program.display(), pid);
        state_tx.send_replace(SessionState::Running);

        let (output_tx, output_rx) = mpsc::channel(self.options.output_capacity.max(1));
        let feeder = tokio::spawn(feed_input(stdin, pcm, cancel.clone()));
        let stderr = tokio::spawn(collect_stderr(stderr));

        let supervisor = Supervisor {
            pid,
            child,
            stdout,
            feeder,
            input_result: None,
            stderr,
            output: output_tx,
            state: state_tx,
            cancel: cancel.clone(),
            deadline: interruption.deadline,
            read_size: self.options.read_size.max(1),
            active: Some(active),
        };
        tokio::spawn(supervisor.run());

        Ok(TranscoderSession { pid, output: output_rx, state: state_rx, interruption, _cancel: cancel.drop_guard() })
    }
}

/// Request-wide stop conditions: server shutdown and the session deadline.
#[derive(Debug, Clone)]
pub struct Interruption {
    shutdown: CancellationToken,
    deadline: Option<Instant>,
}

impl Interruption {
    /// Resolves with the reason once the server shuts down or the deadline passes.
    pub async fn wait(&self) -> PipelineError {
        tokio::select! {
            _ = self.shutdown.cancelled() => PipelineError::Cancelled("server shutting down".to_string()),
            _ = expired(self.deadline) => PipelineError::Cancelled("request timed out".to_string()),
        }
    }
}

/// Handle to a running transcoder, owned by exactly one request.
///
/// Dropping it cancels the session: the child is killed and reaped and both pipes are closed.
pub struct TranscoderSession {
    pid: Option<u32>,
    output: mpsc::Receiver<Result<EncodedChunk, PipelineError>>,
    state: watch::Receiver<SessionState>,
    interruption: Interruption,
    _cancel: DropGuard,
}

impl TranscoderSession {
    /// Next encoded chunk; `None` once the session has closed cleanly.
    pub async fn next_chunk(&mut self) -> Option<Result<EncodedChunk, PipelineError>> {
        self.output.recv().await
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Shutdown and deadline of this session, usable while the session itself is borrowed.
    pub fn interruption(&self) -> Interruption {
        self.interruption.clone()
    }

    /// OS process id of the transcoder, if it was still running when queried at spawn.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl std::fmt::Debug for TranscoderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscoderSession").field("pid", &self.pid).field("state", &self.state()).finish()
    }
}

/// Forward PCM into the child's stdin, then close it so the transcoder can flush and exit.
///
/// Returns the number of bytes forwarded, or the error that ended the input.
async fn feed_input(mut stdin: ChildStdin, mut pcm: PcmStream, cancel: CancellationToken) -> Result<u64, PipelineError> {
    let mut forwarded = 0u64;

    let result = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            next = pcm.next_chunk() => next,
        };

        let chunk = match next {
            None => break Ok(()),
            Some(Err(e)) => break Err(e),
            Some(Ok(chunk)) => chunk,
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            written = stdin.write_all(&chunk) => written,
        };
        if let Err(e) = written {
            break Err(PipelineError::Transcode(format!("failed writing to transcoder input: {}", e)));
        }
        forwarded += chunk.len() as u64;
    };

    // End of input (clean, failed or cancelled) always reaches the child.
    drop(stdin);
    drop(pcm);
    result.map(|()| forwarded)
}

/// Keep the last [`STDERR_TAIL`] bytes the transcoder writes to stderr.
async fn collect_stderr(mut stderr: ChildStderr) -> String {
    let mut tail = Vec::new();
    let mut buf = [0u8; 1024];
    while let Ok(n) = stderr.read(&mut buf).await {
        if n == 0 {
            break;
        }
        tail.extend_from_slice(&buf[..n]);
        if tail.len() > STDERR_TAIL {
            tail.drain(..tail.len() - STDERR_TAIL);
        }
    }
    String::from_utf8_lossy(&tail).trim().to_string()
}

/// Sleep until the deadline, or forever without one.
async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// What woke the output pump.
enum PumpEvent {
    Cancelled,
    Expired,
    ConsumerGone,
    InputClosed(Result<Result<u64, PipelineError>, JoinError>),
    Read(std::io::Result<usize>),
}

/// Owns the child for the whole session and performs the final cleanup.
struct Supervisor {
    pid: Option<u32>,
    child: Child,
    stdout: ChildStdout,
    feeder: JoinHandle<Result<u64, PipelineError>>,
    input_result: Option<Result<u64, PipelineError>>,
    stderr: JoinHandle<String>,
    output: mpsc::Sender<Result<EncodedChunk, PipelineError>>,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    read_size: usize,
    active: Option<ActiveProcess>,
}

impl Supervisor {
    async fn run(mut self) {
        let result = match self.pump().await {
            Ok(()) => self.finish().await,
            Err(e) => Err(e),
        };
        self.cleanup(result).await;
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Transcoder {:?}: {:?} -> {:?}", self.pid, previous, next);
        }
    }

    /// Reason for a cancellation: a dropped session closes the output channel as well.
    fn cancellation(&self) -> PipelineError {
        if self.output.is_closed() { PipelineError::ClientDisconnect } else { PipelineError::Cancelled("server shutting down".to_string()) }
    }

    fn input_closed(&mut self, joined: Result<Result<u64, PipelineError>, JoinError>) {
        let result = joined.unwrap_or_else(|e| Err(PipelineError::Transcode(format!("input forwarding task failed: {}", e))));
        self.input_result = Some(result);
        self.transition(SessionState::Draining);
    }

    /// Relay stdout into the output channel until EOF.
    async fn pump(&mut self) -> Result<(), PipelineError> {
        let mut buf = BytesMut::with_capacity(self.read_size);

        loop {
            buf.reserve(self.read_size);
            let input_open = self.input_result.is_none();

            let event = tokio::select! {
                _ = self.cancel.cancelled() => PumpEvent::Cancelled,
                _ = expired(self.deadline) => PumpEvent::Expired,
                _ = self.output.closed() => PumpEvent::ConsumerGone,
                joined = &mut self.feeder, if input_open => PumpEvent::InputClosed(joined),
                read = self.stdout.read_buf(&mut buf) => PumpEvent::Read(read),
            };

            match event {
                PumpEvent::Cancelled => return Err(self.cancellation()),
                PumpEvent::Expired => return Err(PipelineError::Cancelled("request timed out".to_string())),
                PumpEvent::ConsumerGone => return Err(PipelineError::ClientDisconnect),
                PumpEvent::InputClosed(joined) => self.input_closed(joined),
                PumpEvent::Read(Ok(0)) => return Ok(()),
                PumpEvent::Read(Ok(_)) => {
                    let chunk = buf.split().freeze();
                    let sent = tokio::select! {
                        _ = self.cancel.cancelled() => return Err(self.cancellation()),
                        _ = expired(self.deadline) => return Err(PipelineError::Cancelled("request timed out".to_string())),
                        sent = self.output.send(Ok(chunk)) => sent,
                    };
                    if sent.is_err() {
                        return Err(PipelineError::ClientDisconnect);
                    }
                }
                PumpEvent::Read(Err(e)) => return Err(PipelineError::Transcode(format!("failed reading transcoder output: {}", e))),
            }
        }
    }

    /// Output is exhausted: settle the exit status and the input side's outcome.
    async fn finish(&mut self) -> Result<(), PipelineError> {
        let status = tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.cancellation()),
            _ = expired(self.deadline) => return Err(PipelineError::Cancelled("request timed out".to_string())),
            status = self.child.wait() => status.map_err(|e| PipelineError::Transcode(format!("failed waiting for transcoder: {}", e)))?,
        };

        if self.input_result.is_none() {
            let joined = tokio::select! {
                _ = self.cancel.cancelled() => return Err(self.cancellation()),
                joined = &mut self.feeder => joined,
            };
            self.input_closed(joined);
        }

        let input = self.input_result.clone().unwrap_or(Ok(0));

        // A synthesis failure is the root cause even when the transcoder exited cleanly.
        if let Err(e @ PipelineError::Synthesis(_)) = input {
            return Err(e);
        }

        if !status.success() {
            let stderr = (&mut self.stderr).await.unwrap_or_default();
            let detail = if stderr.is_empty() { String::new() } else { format!(": {}", stderr) };
            return Err(PipelineError::Transcode(format!("transcoder exited with {}{}", status, detail)));
        }

        let forwarded = input?;
        debug!("Transcoder {:?} consumed {} PCM bytes", self.pid, forwarded);
        Ok(())
    }

    /// Runs on every exit path: stop the input, kill and reap the child, report the outcome.
    async fn cleanup(mut self, result: Result<(), PipelineError>) {
        self.cancel.cancel();

        if matches!(self.child.try_wait(), Ok(None))
            && let Err(e) = self.child.start_kill()
        {
            warn!("Failed to kill transcoder {:?}: {}", self.pid, e);
        }
        match self.child.wait().await {
            Ok(status) => debug!("Transcoder {:?} reaped ({})", self.pid, status),
            Err(e) => warn!("Failed to reap transcoder {:?}: {}", self.pid, e),
        }

        if self.input_result.is_none() {
            let _ = (&mut self.feeder).await;
        }
        self.stderr.abort();

        let undelivered = match result {
            Ok(()) => {
                self.transition(SessionState::Closed);
                info!("🎧 Transcoder {:?} finished", self.pid);
                None
            }
            Err(PipelineError::ClientDisconnect) => {
                self.transition(SessionState::Closed);
                info!("🔌 Transcoder {:?} stopped: client disconnected", self.pid);
                None
            }
            Err(e) => {
                self.transition(SessionState::Errored);
                warn!("❌ Transcoder {:?} failed: {}", self.pid, e);
                Some(e)
            }
        };

        // The process is gone; only the error report may still be pending.
        self.active.take();

        if let Some(e) = undelivered {
            // A stalled consumer keeps the channel full: it either reads the error or drops the session.
            tokio::select! {
                _ = self.output.closed() => {}
                _ = self.output.send(Err(e)) => {}
            }
        }
    }
}
