//! Session lifecycle states and close reasons.
//!
//! Both types appear on the wire (`status.state` and `closed.reason`) and are
//! the vocabulary the gateway uses internally, so they live here rather than
//! in the daemon.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a terminal session.
///
/// ```text
/// INITIALIZING ──► RUNNING ──► STOPPING ──► STOPPED
///       │                         ▲
///       └──────► ERROR ───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Subprocess and PTY are being allocated.
    Initializing,
    /// Shell is alive and accepting input.
    Running,
    /// Teardown in progress; buffered output is still delivered.
    Stopping,
    /// All resources released.
    Stopped,
    /// Spawn failed; the session will drain and stop.
    Error,
}

impl SessionState {
    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Initializing, Running)
                | (Initializing, Error)
                | (Running, Stopping)
                | (Error, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Only a running session accepts input, resize or signal requests.
    pub fn accepts_input(self) -> bool {
        self == SessionState::Running
    }

    /// Draining states reject new input but still deliver queued output.
    pub fn is_draining(self) -> bool {
        matches!(self, SessionState::Stopping | SessionState::Error)
    }

    /// A session in one of these states must not be handed out again by the registry.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Error)
    }

    /// Wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Initializing => "INITIALIZING",
            SessionState::Running => "RUNNING",
            SessionState::Stopping => "STOPPING",
            SessionState::Stopped => "STOPPED",
            SessionState::Error => "ERROR",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session was closed. Sent to the client in the final `closed` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Subprocess or PTY creation failed.
    SpawnFailed,
    /// The shell exited on its own.
    ProcessExited,
    /// Reading from or writing to the PTY failed.
    IoError,
    /// The attached client stopped draining output.
    ConsumerStalled,
    /// No input or output for the configured idle period.
    IdleTimeout,
    /// Closed through the administrative surface.
    AdminKill,
    /// The gateway process is shutting down.
    Shutdown,
    /// The registry is at capacity; no shell was spawned.
    SessionLimit,
}

impl CloseReason {
    /// Wire name of the reason.
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::SpawnFailed => "spawn_failed",
            CloseReason::ProcessExited => "process_exited",
            CloseReason::IoError => "io_error",
            CloseReason::ConsumerStalled => "consumer_stalled",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::AdminKill => "admin_kill",
            CloseReason::Shutdown => "shutdown",
            CloseReason::SessionLimit => "session_limit",
        }
    }

    /// Parses a wire name back into a reason.
    pub fn from_wire(s: &str) -> Option<Self> {
        Some(match s {
            "spawn_failed" => CloseReason::SpawnFailed,
            "process_exited" => CloseReason::ProcessExited,
            "io_error" => CloseReason::IoError,
            "consumer_stalled" => CloseReason::ConsumerStalled,
            "idle_timeout" => CloseReason::IdleTimeout,
            "admin_kill" => CloseReason::AdminKill,
            "shutdown" => CloseReason::Shutdown,
            "session_limit" => CloseReason::SessionLimit,
            _ => return None,
        })
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
