//! Typed error hierarchy for gosh-swarm
//!
//! Nothing in the scheduling core escalates to a process-level failure. The
//! worst outcome of any error here is a dropped peer connection or a piece
//! that stays incomplete a little longer.

use thiserror::Error;

use crate::types::PeerId;

/// Main error type for the swarm engine
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Peer violated the wire protocol
    #[error("Protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// Invalid input from the embedder (configuration, layout, ...)
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Invalid state transition
    #[error("Invalid state: cannot {action} while {current_state}")]
    InvalidState {
        action: &'static str,
        current_state: String,
    },

    /// Event referenced a connection we do not know about
    #[error("Unknown peer connection: {0}")]
    UnknownPeer(PeerId),

    /// Piece index outside the torrent
    #[error("Piece {index} out of range (piece count {count})")]
    PieceOutOfRange { index: u32, count: u32 },

    /// Resume snapshot could not be decoded or applied
    #[error("Resume state error: {0}")]
    Resume(String),

    /// Engine task is gone
    #[error("Engine is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Piece message carried no payload
    EmptyBlock,
    /// Block offset not aligned or past the end of the piece
    BadOffset,
    /// Block payload length does not match the block
    BadLength,
    /// Bitfield does not match the piece count
    BitfieldLength,
    /// Message referenced a piece index outside the torrent
    UnknownPiece,
}

impl SwarmError {
    /// Whether this error should terminate the offending connection.
    ///
    /// Protocol faults are fatal to a single connection, never to the session.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::PieceOutOfRange { .. })
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(action: &'static str, current_state: impl ToString) -> Self {
        Self::InvalidState {
            action,
            current_state: current_state.to_string(),
        }
    }
}

/// Result type alias for swarm operations
pub type Result<T> = std::result::Result<T, SwarmError>;

impl From<serde_json::Error> for SwarmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Resume(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SwarmError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Shutdown
    }
}
