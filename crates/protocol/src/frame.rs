//! Frames: the unit of data moving between a client and a terminal session.
//!
//! Outbound frames (`data`, `status`, `closed`) are produced by the session and
//! flow through its outbound queue. Inbound frames (`data`, `resize`, `signal`)
//! are produced by the gateway and applied by the session's writer task.
//! Every frame carries a per-session, per-direction sequence number.

use std::fmt;

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::state::{CloseReason, SessionState};

/// Kind of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Raw terminal bytes.
    Data,
    /// Terminal size change (inbound only).
    Resize,
    /// Signal delivery (inbound only).
    Signal,
    /// Session state notification (outbound only).
    Status,
    /// Terminal frame of a session (outbound only).
    Closed,
}

impl FrameKind {
    /// Lowercase name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Data => "data",
            FrameKind::Resize => "resize",
            FrameKind::Signal => "signal",
            FrameKind::Status => "status",
            FrameKind::Closed => "closed",
        }
    }

    /// Control frames bypass overflow handling in the outbound queue.
    pub fn is_control(self) -> bool {
        matches!(self, FrameKind::Status | FrameKind::Closed)
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    payload: Bytes,
    sequence: u64,
}

impl Frame {
    /// Creates a data frame.
    pub fn data(sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Data,
            payload: payload.into(),
            sequence,
        }
    }

    /// Creates a resize frame. Both dimensions must be non-zero.
    pub fn resize(sequence: u64, cols: u16, rows: u16) -> Result<Self> {
        if cols == 0 || rows == 0 {
            return Err(ProtocolError::InvalidResize { cols, rows });
        }
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&cols.to_be_bytes());
        payload.extend_from_slice(&rows.to_be_bytes());
        Ok(Self {
            kind: FrameKind::Resize,
            payload: payload.into(),
            sequence,
        })
    }

    /// Creates a signal frame carrying the signal name.
    pub fn signal(sequence: u64, name: &str) -> Self {
        Self {
            kind: FrameKind::Signal,
            payload: Bytes::copy_from_slice(name.as_bytes()),
            sequence,
        }
    }

    /// Creates a status frame.
    pub fn status(sequence: u64, state: SessionState) -> Self {
        Self {
            kind: FrameKind::Status,
            payload: Bytes::from_static(state.as_str().as_bytes()),
            sequence,
        }
    }

    /// Creates a closed frame.
    pub fn closed(sequence: u64, reason: CloseReason) -> Self {
        Self {
            kind: FrameKind::Closed,
            payload: Bytes::from_static(reason.as_str().as_bytes()),
            sequence,
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Decodes the `(cols, rows)` pair of a resize frame.
    pub fn resize_dims(&self) -> Result<(u16, u16)> {
        match (self.kind, self.payload.as_ref()) {
            (FrameKind::Resize, [c0, c1, r0, r1]) => Ok((
                u16::from_be_bytes([*c0, *c1]),
                u16::from_be_bytes([*r0, *r1]),
            )),
            _ => Err(ProtocolError::MalformedFrame { kind: "resize" }),
        }
    }

    /// Decodes the payload of a signal, status or closed frame as text.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload).map_err(|_| ProtocolError::MalformedFrame {
            kind: self.kind.as_str(),
        })
    }

    /// Decodes the reason of a closed frame.
    pub fn close_reason(&self) -> Option<CloseReason> {
        if self.kind != FrameKind::Closed {
            return None;
        }
        self.text().ok().and_then(CloseReason::from_wire)
    }
}

/// Returns the length of the longest prefix of `buf` that does not end in
/// the middle of a UTF-8 sequence.
///
/// Bytes that can never become valid UTF-8 do not hold anything back; they
/// are emitted and rendered lossily downstream.
pub fn utf8_boundary(buf: &[u8]) -> usize {
    let len = buf.len();
    // A sequence is at most 4 bytes, so only the last 3 can be an incomplete lead.
    for back in 1..=len.min(3) {
        let byte = buf[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            // continuation byte, keep looking for the lead
            continue;
        }
        let needed = match byte {
            b if b & 0b1000_0000 == 0 => 1,
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => return len,
        };
        return if needed > back { len - back } else { len };
    }
    len
}
