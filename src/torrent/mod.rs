//! BitTorrent swarm core
//!
//! This module holds the scheduling side of a BitTorrent client:
//! - Piece and block bookkeeping
//! - Per-peer views of live connections
//! - Block scheduling (download side)
//! - Choking algorithm (upload side)
//! - Transfer state machine
//! - Known-peer list and connection candidate weighting
//! - Resume snapshots

pub mod choking;
pub mod events;
pub mod peer;
pub mod peer_selection;
pub mod picker;
pub mod piece;
pub mod resume;
pub mod state;
pub mod swarm;

// Re-export commonly used types
pub use choking::{ChokingDecision, ChokingManager, PeerStats};
pub use events::{Command, Outbox, SwarmEvent, SwarmNotice};
pub use peer::{ConnectionState, PeerConnection, PeerSet};
pub use peer_selection::{KnownPeer, KnownPeers};
pub use picker::BlockScheduler;
pub use piece::{BlockOutcome, Piece, PiecePhase, PieceTable, VerifyOutcome};
pub use resume::{PartialPiece, ResumeState, RESUME_VERSION};
pub use state::{Completion, TransferStateMachine};
pub use swarm::Swarm;
