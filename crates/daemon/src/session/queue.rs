//! Outbound queue and flow control.
//!
//! Each session owns one bounded FIFO of [`Frame`]s between its PTY reader
//! (the only producer) and the attached gateway connections. Sequence
//! numbers are assigned here, at production time, so every subscriber sees
//! the same total order.
//!
//! A frame stays in the queue until every attached subscriber has consumed
//! it. With nobody attached, frames wait up to the capacity and the next
//! subscriber starts at the oldest one.
//!
//! When the queue is full the [`OverflowPolicy`] decides:
//! - `Backpressure` parks the producer until space frees up. The reader then
//!   stops reading, the PTY buffer fills and the shell itself blocks. If no
//!   space frees up within the stall timeout, [`QueueError::ConsumerStalled`]
//!   is returned.
//! - `DropNewest` discards the new frame. Its sequence number is still
//!   consumed, so subscribers can detect the gap.
//!
//! Status and closed frames are never dropped and never wait.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use protocol::{CloseReason, Frame, SessionState};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default queue capacity in frames.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default time the producer may stay blocked on a full queue.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Behaviour of a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Block the producer until the consumer catches up.
    #[default]
    Backpressure,
    /// Drop the incoming data frame.
    DropNewest,
}

/// Queue sizing and overflow behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of buffered frames.
    pub capacity: usize,
    /// What to do when full.
    pub policy: OverflowPolicy,
    /// How long the producer may be blocked before giving up.
    pub stall_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            policy: OverflowPolicy::Backpressure,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

/// Errors returned to the producer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue no longer accepts frames.
    #[error("outbound queue closed")]
    Closed,

    /// Backpressure held for longer than the stall timeout.
    #[error("consumer stalled for {0:?}")]
    ConsumerStalled(Duration),
}

/// Result of a successful data push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The frame was buffered with this sequence number.
    Enqueued(u64),
    /// The frame was discarded; this sequence number will never be delivered.
    Dropped(u64),
}

/// Counters describing the queue's history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Frames accepted into the queue.
    pub enqueued: u64,
    /// Frames handed to subscribers (counted once per subscriber).
    pub delivered: u64,
    /// Data frames discarded under `DropNewest`.
    pub dropped: u64,
    /// Number of pushes that had to wait for space.
    pub backpressure_waits: u64,
}

struct QueueState {
    frames: VecDeque<Frame>,
    next_sequence: u64,
    closed: bool,
    /// Subscriber id -> sequence of the next frame it wants.
    cursors: HashMap<u64, u64>,
    next_subscriber: u64,
    stats: QueueStats,
}

impl QueueState {
    fn allocate_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Drops frames every subscriber has moved past. Returns true if anything was freed.
    fn evict(&mut self) -> bool {
        let Some(low_water) = self.cursors.values().copied().min() else {
            return false;
        };
        let before = self.frames.len();
        while self
            .frames
            .front()
            .is_some_and(|frame| frame.sequence() < low_water)
        {
            self.frames.pop_front();
        }
        self.frames.len() != before
    }
}

struct Shared {
    state: Mutex<QueueState>,
    /// Signalled when a frame is added or the queue closes.
    readable: Notify,
    /// Signalled when frames are evicted or a subscriber leaves.
    writable: Notify,
    config: QueueConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded, ordered buffer between a session's PTY reader and its subscribers.
#[derive(Clone)]
pub struct OutboundQueue {
    shared: Arc<Shared>,
}

impl OutboundQueue {
    /// Creates an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    frames: VecDeque::with_capacity(capacity.min(1024)),
                    next_sequence: 0,
                    closed: false,
                    cursors: HashMap::new(),
                    next_subscriber: 0,
                    stats: QueueStats::default(),
                }),
                readable: Notify::new(),
                writable: Notify::new(),
                config: QueueConfig { capacity, ..config },
            }),
        }
    }

    /// Appends a data frame, applying the overflow policy when full.
    pub async fn push(&self, payload: Bytes) -> Result<PushOutcome, QueueError> {
        let config = &self.shared.config;
        let deadline = Instant::now() + config.stall_timeout;
        let mut waited = false;

        loop {
            let writable = self.shared.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }

                if state.frames.len() < config.capacity {
                    let sequence = state.allocate_sequence();
                    state.frames.push_back(Frame::data(sequence, payload));
                    state.stats.enqueued += 1;
                    drop(state);
                    self.shared.readable.notify_waiters();
                    return Ok(PushOutcome::Enqueued(sequence));
                }

                match config.policy {
                    OverflowPolicy::DropNewest => {
                        let sequence = state.allocate_sequence();
                        state.stats.dropped += 1;
                        if state.stats.dropped == 1 || state.stats.dropped % 100 == 0 {
                            tracing::warn!(
                                dropped = state.stats.dropped,
                                capacity = config.capacity,
                                "Outbound queue full, dropping output"
                            );
                        }
                        return Ok(PushOutcome::Dropped(sequence));
                    }
                    OverflowPolicy::Backpressure => {
                        if !waited {
                            waited = true;
                            state.stats.backpressure_waits += 1;
                            tracing::trace!(
                                capacity = config.capacity,
                                "Outbound queue full, pausing reader"
                            );
                        }
                    }
                }
            }

            if tokio::time::timeout_at(deadline, writable).await.is_err() {
                return Err(QueueError::ConsumerStalled(config.stall_timeout));
            }
        }
    }

    /// Appends a status frame. Never blocks and ignores capacity.
    pub fn push_status(&self, state: SessionState) -> Result<u64, QueueError> {
        self.push_control(Frame::status, state, false)
    }

    /// Appends the final closed frame and closes the queue.
    ///
    /// Subscribers receive everything still buffered, then the closed frame,
    /// then end of stream.
    pub fn push_closed(&self, reason: CloseReason) -> Result<u64, QueueError> {
        self.push_control(Frame::closed, reason, true)
    }

    fn push_control<T>(
        &self,
        build: impl FnOnce(u64, T) -> Frame,
        arg: T,
        close: bool,
    ) -> Result<u64, QueueError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        let sequence = state.allocate_sequence();
        state.frames.push_back(build(sequence, arg));
        state.stats.enqueued += 1;
        if close {
            state.closed = true;
        }
        drop(state);
        self.shared.readable.notify_waiters();
        if close {
            self.shared.writable.notify_waiters();
        }
        Ok(sequence)
    }

    /// Closes the queue without a closed frame. Pending frames stay readable.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
    }

    /// Attaches a new subscriber, starting at the oldest buffered frame.
    pub fn subscribe(&self) -> OutputStream {
        let mut state = self.shared.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        let start = state
            .frames
            .front()
            .map(Frame::sequence)
            .unwrap_or(state.next_sequence);
        state.cursors.insert(id, start);

        OutputStream {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    /// Waits until attached subscribers have consumed everything buffered.
    ///
    /// Returns immediately when nobody is attached. Returns false if the
    /// timeout elapsed with frames still pending.
    pub async fn drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let writable = self.shared.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            {
                let state = self.shared.lock();
                if state.cursors.is_empty() {
                    return state.frames.is_empty();
                }
                if state.frames.is_empty() {
                    return true;
                }
            }

            if tokio::time::timeout_at(deadline, writable).await.is_err() {
                return false;
            }
        }
    }

    /// Number of buffered frames.
    pub fn len(&self) -> usize {
        self.shared.lock().frames.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity in frames.
    pub fn capacity(&self) -> usize {
        self.shared.config.capacity
    }

    /// Configured overflow policy.
    pub fn policy(&self) -> OverflowPolicy {
        self.shared.config.policy
    }

    /// Returns whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().cursors.len()
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> QueueStats {
        self.shared.lock().stats.clone()
    }
}

/// Consumer side of an [`OutboundQueue`].
///
/// Dropping the stream detaches the subscriber; frames it has not consumed
/// stay available to the others.
pub struct OutputStream {
    shared: Arc<Shared>,
    id: u64,
}

impl OutputStream {
    /// Receives the next frame in sequence order.
    ///
    /// Returns `None` once the queue is closed and everything buffered for
    /// this subscriber has been delivered.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            let readable = self.shared.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            {
                let mut state = self.shared.lock();
                let cursor = state.cursors.get(&self.id).copied().unwrap_or(u64::MAX);
                let index = state.frames.partition_point(|f| f.sequence() < cursor);

                if let Some(frame) = state.frames.get(index).cloned() {
                    state.cursors.insert(self.id, frame.sequence() + 1);
                    state.stats.delivered += 1;
                    let freed = state.evict();
                    drop(state);
                    if freed {
                        self.shared.writable.notify_waiters();
                    }
                    return Some(frame);
                }

                if state.closed {
                    return None;
                }
            }

            readable.await;
        }
    }

    /// Returns the next frame if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Frame> {
        let mut state = self.shared.lock();
        let cursor = state.cursors.get(&self.id).copied().unwrap_or(u64::MAX);
        let index = state.frames.partition_point(|f| f.sequence() < cursor);
        let frame = state.frames.get(index).cloned()?;
        state.cursors.insert(self.id, frame.sequence() + 1);
        state.stats.delivered += 1;
        let freed = state.evict();
        drop(state);
        if freed {
            self.shared.writable.notify_waiters();
        }
        Some(frame)
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.cursors.remove(&self.id);
        state.evict();
        drop(state);
        self.shared.writable.notify_waiters();
    }
}
