//! Per-connection session state.
//!
//! A session lives exactly as long as one accepted connection. It buffers
//! input until the peer half-closes, then walks forward through decode,
//! dispatch, an optional completion wait and a single write before closing.

use bytes::BytesMut;
use thiserror::Error;

use super::frame::{self, Frame};

/// Response sent for an empty payload.
pub const EMPTY_RESPONSE: &[u8] = b"\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    AcceptingData,
    Decoding,
    Dispatching,
    Waiting,
    Writing,
    Closed,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::AcceptingData => "accepting_data",
            SessionPhase::Decoding => "decoding",
            SessionPhase::Dispatching => "dispatching",
            SessionPhase::Waiting => "waiting",
            SessionPhase::Writing => "writing",
            SessionPhase::Closed => "closed",
        }
    }

    fn allows(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (AcceptingData, Decoding)
                | (Decoding, Dispatching)
                | (Decoding, Writing)
                | (Dispatching, Waiting)
                | (Dispatching, Writing)
                | (Waiting, Writing)
                | (Writing, Closed)
        ) || (next == Closed && self != Closed)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("request exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },
    #[error("input already finished; session is {phase}")]
    InputClosed { phase: &'static str },
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

/// What the handler should do once input is complete.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionInput {
    /// Nothing was sent; answer with [`EMPTY_RESPONSE`] without rendering.
    Empty,
    Frame(Frame),
}

#[derive(Debug)]
pub struct ConnectionSession {
    id: u64,
    buffer: BytesMut,
    max_bytes: usize,
    phase: SessionPhase,
}

impl ConnectionSession {
    pub fn new(id: u64, max_bytes: usize) -> Self {
        Self {
            id,
            buffer: BytesMut::new(),
            max_bytes,
            phase: SessionPhase::AcceptingData,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Append a received chunk; content is not interpreted yet.
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), SessionError> {
        if self.phase != SessionPhase::AcceptingData {
            return Err(SessionError::InputClosed {
                phase: self.phase.as_str(),
            });
        }
        if self.buffer.len().saturating_add(chunk.len()) > self.max_bytes {
            return Err(SessionError::PayloadTooLarge {
                limit: self.max_bytes,
            });
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Called on peer half-close: moves to decoding and yields the request.
    pub fn finish_input(&mut self) -> Result<SessionInput, SessionError> {
        self.advance(SessionPhase::Decoding)?;
        let payload = self.buffer.split().freeze();
        if payload.is_empty() {
            return Ok(SessionInput::Empty);
        }
        Ok(SessionInput::Frame(frame::decode(&payload)))
    }

    pub fn advance(&mut self, next: SessionPhase) -> Result<(), SessionError> {
        if !self.phase.allows(next) {
            return Err(SessionError::InvalidTransition {
                from: self.phase.as_str(),
                to: next.as_str(),
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Terminal transition; idempotent so error paths can always call it.
    pub fn close(&mut self) {
        self.phase = SessionPhase::Closed;
    }
}
