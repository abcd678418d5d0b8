//! JSON messages exchanged over the terminal WebSocket.
//!
//! Inbound (client → gateway):
//!
//! ```json
//! {"type":"input","text":"ls -la\n"}
//! {"type":"resize","cols":120,"rows":40}
//! {"type":"signal","name":"SIGINT"}
//! ```
//!
//! Outbound (gateway → client):
//!
//! ```json
//! {"type":"output","data":"total 42\r\n"}
//! {"type":"status","state":"RUNNING"}
//! {"type":"closed","reason":"process_exited"}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::frame::{Frame, FrameKind};
use crate::state::{CloseReason, SessionState};

/// Message sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Keystrokes or pasted text for the shell.
    Input { text: String },
    /// New terminal dimensions.
    Resize { cols: u16, rows: u16 },
    /// Signal for the terminal's foreground process, e.g. `SIGINT`.
    Signal { name: String },
}

impl ClientMessage {
    /// Parses and validates a client message from JSON text.
    pub fn parse(text: &str) -> Result<Self> {
        let message: ClientMessage = serde_json::from_str(text)?;
        if let ClientMessage::Resize { cols, rows } = message {
            if cols == 0 || rows == 0 {
                return Err(ProtocolError::InvalidResize { cols, rows });
            }
        }
        Ok(message)
    }

    /// Serializes the message to JSON text.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Message sent by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Terminal output.
    Output { data: String },
    /// Session state change.
    Status { state: SessionState },
    /// The session is gone; no further messages follow.
    Closed { reason: CloseReason },
}

impl ServerMessage {
    /// Converts an outbound frame into its wire message.
    ///
    /// Data payloads are decoded lossily; the session already keeps UTF-8
    /// sequences whole across reads, so replacement characters only appear
    /// for bytes that were never valid text.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        match frame.kind() {
            FrameKind::Data => Ok(ServerMessage::Output {
                data: String::from_utf8_lossy(frame.payload()).into_owned(),
            }),
            FrameKind::Status => {
                let state = serde_json::from_value(serde_json::Value::String(
                    frame.text()?.to_string(),
                ))?;
                Ok(ServerMessage::Status { state })
            }
            FrameKind::Closed => frame
                .close_reason()
                .map(|reason| ServerMessage::Closed { reason })
                .ok_or(ProtocolError::MalformedFrame { kind: "closed" }),
            kind @ (FrameKind::Resize | FrameKind::Signal) => {
                Err(ProtocolError::MalformedFrame { kind: kind.as_str() })
            }
        }
    }

    /// Parses a server message from JSON text.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the message to JSON text.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns true for the final message of a session.
    pub fn is_closed(&self) -> bool {
        matches!(self, ServerMessage::Closed { .. })
    }
}
