//! Session management module.
//!
//! A session is one shell on one PTY. This module spawns sessions, keeps
//! them in the [`SessionRegistry`], moves their output through a bounded
//! [`OutboundQueue`] and tears them down through a single close path.

mod handle;
pub mod manager;
pub mod pty;
pub mod queue;
mod shutdown;
mod watchdog;

pub use handle::{Session, SessionInfo, SessionOptions};
pub use manager::{RegistryHandle, SessionManager, SessionRegistry};
pub use pty::{detect_shell, parse_signal, PtyProcess, SessionError, SessionId, SpawnOptions};
pub use queue::{
    OutboundQueue, OutputStream, OverflowPolicy, PushOutcome, QueueConfig, QueueError, QueueStats,
};
