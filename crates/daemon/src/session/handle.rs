//! A terminal session: one shell, one PTY, one outbound queue.
//!
//! The session hosts the lifecycle state machine. All state reads and
//! writes happen under the session's own lock, and `write`/`resize`/`signal`
//! check the state under that same lock before handing a frame to the
//! writer task, so they cannot interleave with a concurrent close.
//!
//! Tasks owned by a running session:
//! - reader: blocking PTY reads (on the blocking pool) feeding the outbound queue
//! - writer: applies inbound frames to the PTY in arrival order
//! - idle watchdog, when an idle timeout is configured

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use portable_pty::{Child, MasterPty, PtySize};
use protocol::{utf8_boundary, CloseReason, Frame, FrameKind, SessionState};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::RegistryHandle;
use super::pty::{parse_signal, signal_foreground, PtyProcess, SessionError, SessionId, SpawnOptions};
use super::queue::{OutboundQueue, OutputStream, PushOutcome, QueueConfig, QueueError, QueueStats};
use super::watchdog;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Runtime options every session is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// How to start the shell.
    pub spawn: SpawnOptions,
    /// Outbound queue sizing and overflow policy.
    pub queue: QueueConfig,
    /// Close the session after this long without input or output.
    pub idle_timeout: Option<Duration>,
    /// Time between the hangup signal and a forced kill.
    pub kill_grace: Duration,
    /// How long teardown waits for the reader and the subscriber.
    pub drain_timeout: Duration,
    /// Pending inbound frames before `write` reports `InputQueueFull`.
    pub input_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            spawn: SpawnOptions::default(),
            queue: QueueConfig::default(),
            idle_timeout: None,
            kill_grace: Duration::from_secs(2),
            drain_timeout: Duration::from_millis(500),
            input_capacity: 1024,
        }
    }
}

/// Snapshot of a session for listings and the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Spawn generation of this id.
    pub generation: u64,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
    /// Unix timestamp (seconds) of creation.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last input or output.
    pub last_activity_at: u64,
    /// Number of attached output subscribers.
    pub subscribers: usize,
    /// Frames waiting in the outbound queue.
    pub queued_frames: usize,
    /// Outbound queue counters.
    pub queue: QueueStats,
    /// Exit code of the shell, once reaped.
    pub exit_code: Option<u32>,
    /// Why the session is closing or closed.
    pub close_reason: Option<CloseReason>,
}

pub(super) struct Inner {
    pub(super) state: SessionState,
    pub(super) cols: u16,
    pub(super) rows: u16,
    pub(super) input_tx: Option<mpsc::Sender<Frame>>,
    pub(super) input_sequence: u64,
    pub(super) close_reason: Option<CloseReason>,
    pub(super) exit_code: Option<u32>,
}

/// A PTY-backed shell session.
pub struct Session {
    pub(super) id: SessionId,
    pub(super) generation: u64,
    pub(super) pid: Option<u32>,
    pub(super) created_at: SystemTime,
    started: Instant,
    /// Milliseconds after `started` of the last input or output.
    last_activity_ms: AtomicU64,
    pub(super) inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionState>,
    pub(super) master: Arc<Mutex<Option<Box<dyn MasterPty + Send>>>>,
    pub(super) child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    pub(super) reader_task: Mutex<Option<JoinHandle<()>>>,
    pub(super) queue: OutboundQueue,
    pub(super) cancel: CancellationToken,
    pub(super) options: SessionOptions,
    pub(super) registry: RegistryHandle,
    pub(super) teardowns: AtomicU32,
}

impl Session {
    /// Spawns a shell for `id` and returns the session.
    ///
    /// This never fails: if the PTY or the shell cannot be created the
    /// session goes through ERROR to STOPPED, and its queue holds the
    /// `closed{spawn_failed}` frame for whoever subscribes.
    pub async fn spawn(
        id: SessionId,
        generation: u64,
        options: SessionOptions,
        registry: RegistryHandle,
    ) -> Arc<Self> {
        let spawn_options = options.spawn.clone();
        let spawned = tokio::task::spawn_blocking(move || PtyProcess::spawn(&spawn_options))
            .await
            .unwrap_or_else(|e| Err(SessionError::SpawnFailed(e.to_string())));

        match spawned {
            Ok(process) => {
                let session = Arc::new(Self::new(id, generation, process.pid, options, registry));
                session.start(process);
                session
            }
            Err(e) => {
                tracing::error!(
                    session_id = %id,
                    generation = generation,
                    error = %e,
                    "Failed to spawn session"
                );
                let session = Arc::new(Self::new(id, generation, None, options, registry));
                {
                    let mut inner = session.lock_inner();
                    session.transition(&mut inner, SessionState::Error);
                }
                session.close(CloseReason::SpawnFailed).await;
                session
            }
        }
    }

    fn new(
        id: SessionId,
        generation: u64,
        pid: Option<u32>,
        options: SessionOptions,
        registry: RegistryHandle,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Initializing);
        Self {
            id,
            generation,
            pid,
            created_at: SystemTime::now(),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                state: SessionState::Initializing,
                cols: options.spawn.cols,
                rows: options.spawn.rows,
                input_tx: None,
                input_sequence: 0,
                close_reason: None,
                exit_code: None,
            }),
            state_tx,
            master: Arc::new(Mutex::new(None)),
            child: Mutex::new(None),
            reader_task: Mutex::new(None),
            queue: OutboundQueue::new(options.queue.clone()),
            cancel: CancellationToken::new(),
            options,
            registry,
            teardowns: AtomicU32::new(0),
        }
    }

    /// INITIALIZING → RUNNING: hands the PTY handles to their tasks.
    fn start(self: &Arc<Self>, process: PtyProcess) {
        let PtyProcess {
            master,
            reader,
            writer,
            child,
            pid,
        } = process;

        *lock(&self.master) = Some(master);
        *lock(&self.child) = Some(child);

        let (input_tx, input_rx) = mpsc::channel(self.options.input_capacity.max(1));
        {
            let mut inner = self.lock_inner();
            inner.input_tx = Some(input_tx);
            self.transition(&mut inner, SessionState::Running);
        }
        self.touch();

        let reader_task = tokio::spawn(Arc::clone(self).read_loop(reader));
        *lock(&self.reader_task) = Some(reader_task);

        let session = Arc::clone(self);
        let runtime = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || session.write_loop(writer, input_rx, runtime));

        if let Some(idle_timeout) = self.options.idle_timeout {
            watchdog::spawn_idle_watchdog(Arc::clone(self), idle_timeout);
        }

        tracing::info!(
            session_id = %self.id,
            generation = self.generation,
            pid = pid,
            "Session running"
        );
    }

    /// Moves to `next` if the edge is legal and announces it to subscribers.
    ///
    /// Must be called with the state lock held so status frames leave in
    /// the same order the transitions happened.
    pub(super) fn transition(&self, inner: &mut MutexGuard<'_, Inner>, next: SessionState) -> bool {
        let current = inner.state;
        if !current.can_transition_to(next) {
            tracing::warn!(
                session_id = %self.id,
                from = %current,
                to = %next,
                "Rejected illegal state transition"
            );
            return false;
        }

        inner.state = next;
        self.state_tx.send_replace(next);
        if next != SessionState::Stopped {
            // The closed frame, not a status frame, ends the stream.
            let _ = self.queue.push_status(next);
        }

        tracing::debug!(
            session_id = %self.id,
            from = %current,
            to = %next,
            "Session state changed"
        );
        true
    }

    pub(super) fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the spawn generation of this session's id.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the process ID of the shell, if it was spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.lock_inner().state
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> (u16, u16) {
        let inner = self.lock_inner();
        (inner.cols, inner.rows)
    }

    /// Returns why the session is closing, once a close has started.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock_inner().close_reason
    }

    /// Returns the shell's exit code, once reaped.
    pub fn exit_code(&self) -> Option<u32> {
        self.lock_inner().exit_code
    }

    /// Number of times a teardown sequence ran. Always 0 or 1.
    pub fn teardown_count(&self) -> u32 {
        self.teardowns.load(Ordering::SeqCst)
    }

    /// Time since the last input or output.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    pub(super) fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Writes input for the shell.
    ///
    /// Accepted only while RUNNING; otherwise rejected immediately with
    /// [`SessionError::NotRunning`]. Never waits for the PTY.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.submit(|sequence| Ok(Frame::data(sequence, Bytes::copy_from_slice(data))))?;
        self.touch();
        Ok(())
    }

    /// Resizes the terminal. Same contract as [`Session::write`].
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.submit(|sequence| {
            Frame::resize(sequence, cols, rows).map_err(|_| SessionError::InvalidSize { cols, rows })
        })?;

        let mut inner = self.lock_inner();
        inner.cols = cols;
        inner.rows = rows;
        Ok(())
    }

    /// Sends a signal to the terminal's foreground process group.
    /// Same contract as [`Session::write`].
    pub fn signal(&self, name: &str) -> Result<(), SessionError> {
        self.submit(|sequence| {
            parse_signal(name)?;
            Ok(Frame::signal(sequence, name))
        })
    }

    fn submit(
        &self,
        build: impl FnOnce(u64) -> Result<Frame, SessionError>,
    ) -> Result<(), SessionError> {
        let mut inner = self.lock_inner();
        let not_running = |state| SessionError::NotRunning {
            id: self.id.clone(),
            state,
        };

        if !inner.state.accepts_input() {
            return Err(not_running(inner.state));
        }
        let frame = build(inner.input_sequence)?;
        let tx = inner
            .input_tx
            .as_ref()
            .ok_or_else(|| not_running(inner.state))?;

        match tx.try_send(frame) {
            Ok(()) => {
                inner.input_sequence += 1;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(SessionError::InputQueueFull(self.id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(not_running(inner.state)),
        }
    }

    /// Attaches an output subscriber.
    ///
    /// The stream starts at the oldest frame still buffered and ends after
    /// the session's closed frame.
    pub fn subscribe(&self) -> OutputStream {
        self.queue.subscribe()
    }

    /// Waits until the session reaches STOPPED.
    pub async fn stopped(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Stopped).await;
    }

    /// Returns a snapshot for listings.
    pub fn info(&self) -> SessionInfo {
        let inner = self.lock_inner();
        let last_activity = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        SessionInfo {
            id: self.id.clone(),
            generation: self.generation,
            state: inner.state,
            pid: self.pid,
            cols: inner.cols,
            rows: inner.rows,
            created_at: unix_secs(self.created_at),
            last_activity_at: unix_secs(self.created_at + last_activity),
            subscribers: self.queue.subscriber_count(),
            queued_frames: self.queue.len(),
            queue: self.queue.stats(),
            exit_code: inner.exit_code,
            close_reason: inner.close_reason,
        }
    }

    /// Reads PTY output into the outbound queue until EOF or error.
    ///
    /// Cancellation does not discard output: once a close starts, the loop
    /// keeps draining what the PTY still holds and only gives up on a read
    /// that stays silent for the drain timeout.
    async fn read_loop(self: Arc<Self>, mut reader: Box<dyn Read + Send>) {
        // Holds an incomplete UTF-8 sequence until the rest arrives.
        let mut pending: Vec<u8> = Vec::new();

        let reason = loop {
            let mut read = tokio::task::spawn_blocking(move || {
                let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                let result = reader.read(&mut buffer).map(|n| {
                    buffer.truncate(n);
                    buffer
                });
                (reader, result)
            });

            let joined = tokio::select! {
                biased;
                joined = &mut read => joined,
                _ = self.cancel.cancelled() => {
                    match tokio::time::timeout(self.options.drain_timeout, &mut read).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            tracing::debug!(session_id = %self.id, "PTY silent after close, stop reading");
                            break None;
                        }
                    }
                }
            };
            let (returned, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(session_id = %self.id, error = %e, "Read task panicked");
                    break Some(CloseReason::IoError);
                }
            };
            reader = returned;

            let data = match result {
                Ok(data) if data.is_empty() => {
                    tracing::info!(session_id = %self.id, "PTY EOF - process exited");
                    break Some(CloseReason::ProcessExited);
                }
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Linux reports a hung-up slave as EIO rather than EOF.
                    if e.raw_os_error() == Some(nix::errno::Errno::EIO as i32) || self.child_exited() {
                        tracing::info!(session_id = %self.id, "PTY closed - process exited");
                        break Some(CloseReason::ProcessExited);
                    }
                    tracing::error!(session_id = %self.id, error = %e, "Error reading from PTY");
                    break Some(CloseReason::IoError);
                }
            };

            self.touch();
            pending.extend_from_slice(&data);
            let boundary = utf8_boundary(&pending);
            if boundary == 0 {
                continue;
            }
            let rest = pending.split_off(boundary);
            let chunk = std::mem::replace(&mut pending, rest);

            // Not raced against cancellation: a chunk already read is either
            // queued or lost only when the queue itself closes.
            match self.queue.push(Bytes::from(chunk)).await {
                Ok(PushOutcome::Enqueued(_)) => {}
                Ok(PushOutcome::Dropped(sequence)) => {
                    tracing::trace!(session_id = %self.id, sequence = sequence, "Output chunk dropped");
                }
                Err(QueueError::ConsumerStalled(waited)) => {
                    tracing::warn!(
                        session_id = %self.id,
                        waited_ms = waited.as_millis() as u64,
                        "Output consumer stalled, abandoning session"
                    );
                    break Some(CloseReason::ConsumerStalled);
                }
                Err(QueueError::Closed) => break None,
            }
        };

        // A trailing partial character still goes out, lossily decoded.
        if !pending.is_empty() && reason != Some(CloseReason::ConsumerStalled) {
            let _ = self.queue.push(Bytes::from(pending)).await;
        }

        tracing::debug!(session_id = %self.id, "Reader loop ended");

        // A close already under way owns the teardown.
        if let Some(reason) = reason.filter(|_| !self.cancel.is_cancelled()) {
            // Close waits for this task, so it has to run on its own.
            let session = Arc::clone(&self);
            tokio::spawn(async move {
                session.close(reason).await;
            });
        }
    }

    /// Applies inbound frames to the PTY in arrival order.
    fn write_loop(
        self: Arc<Self>,
        mut writer: Box<dyn Write + Send>,
        mut input_rx: mpsc::Receiver<Frame>,
        runtime: tokio::runtime::Handle,
    ) {
        while let Some(frame) = input_rx.blocking_recv() {
            if self.cancel.is_cancelled() {
                break;
            }

            match frame.kind() {
                FrameKind::Data => {
                    let result = writer
                        .write_all(frame.payload())
                        .and_then(|()| writer.flush());
                    if let Err(e) = result {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        tracing::error!(
                            session_id = %self.id,
                            sequence = frame.sequence(),
                            error = %e,
                            "Error writing to PTY"
                        );
                        let session = Arc::clone(&self);
                        runtime.spawn(async move {
                            session.close(CloseReason::IoError).await;
                        });
                        break;
                    }
                }
                FrameKind::Resize => {
                    if let Err(e) = self.apply_resize(&frame) {
                        tracing::warn!(session_id = %self.id, error = %e, "Failed to resize PTY");
                    }
                }
                FrameKind::Signal => {
                    if let Err(e) = self.apply_signal(&frame) {
                        tracing::warn!(session_id = %self.id, error = %e, "Failed to deliver signal");
                    }
                }
                FrameKind::Status | FrameKind::Closed => {
                    tracing::warn!(session_id = %self.id, kind = %frame.kind(), "Ignoring outbound frame kind on input");
                }
            }
        }

        tracing::debug!(session_id = %self.id, "Writer loop ended");
    }

    fn apply_resize(&self, frame: &Frame) -> Result<(), SessionError> {
        let (cols, rows) = frame
            .resize_dims()
            .map_err(|e| SessionError::Io(std::io::Error::other(e)))?;
        let master = lock(&self.master);
        let Some(master) = master.as_ref() else {
            return Ok(());
        };
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))?;

        tracing::debug!(session_id = %self.id, cols = cols, rows = rows, "Resized PTY");
        Ok(())
    }

    fn apply_signal(&self, frame: &Frame) -> Result<(), SessionError> {
        let name = frame
            .text()
            .map_err(|e| SessionError::Io(std::io::Error::other(e)))?;
        let signal = parse_signal(name)?;
        let master = lock(&self.master);
        let Some(master) = master.as_ref() else {
            return Ok(());
        };
        signal_foreground(&**master, self.pid, signal)?;

        tracing::debug!(session_id = %self.id, signal = %signal, "Delivered signal");
        Ok(())
    }

    /// Checks whether the shell has exited, recording its exit code.
    pub(super) fn child_exited(&self) -> bool {
        let mut child = lock(&self.child);
        let Some(child) = child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.lock_inner().exit_code = Some(status.exit_code());
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::debug!(session_id = %self.id, error = %e, "try_wait failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

/// Locks a mutex, recovering the data if a holder panicked.
pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
