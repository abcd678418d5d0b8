//! # PtyGate Protocol Library
//!
//! Wire types for the PtyGate terminal session multiplexer.
//!
//! ## Overview
//!
//! - **Frames**: sequenced units of terminal data and control flowing through
//!   a session's queues
//! - **Session States**: the lifecycle vocabulary shared by server and clients
//! - **Messages**: JSON messages carried over the terminal WebSocket
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        ClientMessage / ServerMessage    │  JSON text frames
//! ├─────────────────────────────────────────┤
//! │                 Frame                   │  kind + payload + sequence
//! ├─────────────────────────────────────────┤
//! │        PTY session (ptygate daemon)     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, Frame, ServerMessage, SessionState};
//!
//! let msg = ClientMessage::parse(r#"{"type":"input","text":"ls\n"}"#).unwrap();
//! assert!(matches!(msg, ClientMessage::Input { .. }));
//!
//! let frame = Frame::status(0, SessionState::Running);
//! let wire = ServerMessage::from_frame(&frame).unwrap().to_json().unwrap();
//! assert_eq!(wire, r#"{"type":"status","state":"RUNNING"}"#);
//! ```

pub mod error;
pub mod frame;
pub mod messages;
pub mod state;

pub use error::{ProtocolError, Result};
pub use frame::{utf8_boundary, Frame, FrameKind};
pub use messages::{ClientMessage, ServerMessage};
pub use state::{CloseReason, SessionState};
