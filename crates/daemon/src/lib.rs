//! # PtyGate
//!
//! Per-conversation shell sessions streamed over WebSocket.
//!
//! ## Overview
//!
//! Each client connects to `/ws/terminal/{session_id}`. The first connection
//! for an id spawns a shell on a pseudo-terminal; later connections with the
//! same id attach to that shell. Output flows through a bounded queue that
//! pauses the shell instead of dropping data when the client falls behind.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Gateway                             │
//! │     /ws/terminal/{id}          /health  /api/sessions        │
//! ├──────────────────────────────────────────────────────────────┤
//! │                      Session Registry                        │
//! │            (exactly one spawn per id generation)             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐    │
//! │  │   Session    │  │   Outbound   │  │  Close path and  │    │
//! │  │  (PTY, FSM)  │─▶│    Queue     │  │  idle watchdog   │    │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ptygate::gateway::Gateway;
//! use ptygate::session::SessionRegistry;
//! use ptygate::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let registry = Arc::new(SessionRegistry::new(
//!         config.session_options(),
//!         config.session.max_sessions,
//!     ));
//!
//!     let gateway = Gateway::bind(config.bind_addr()?, registry).await?;
//!     gateway.run().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`logging`]: Tracing subscriber setup
//! - [`session`]: PTY sessions, outbound queue, registry, close path
//! - [`gateway`]: WebSocket endpoint, admin HTTP surface and its client

pub mod config;
pub mod gateway;
pub mod logging;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{
    OutboundQueue, OverflowPolicy, QueueConfig, Session, SessionError, SessionId, SessionInfo,
    SessionManager, SessionOptions, SessionRegistry,
};

// Re-export gateway types for convenience
pub use gateway::{AdminClient, Gateway};
