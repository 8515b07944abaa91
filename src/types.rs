//! Core types for gosh-swarm
//!
//! Value types shared between the piece table, the schedulers and the
//! orchestrator.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};

/// Identifier of a live peer-wire connection.
///
/// Assigned by the connection layer; never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Client-level transfer phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransferState {
    /// Nothing running
    #[default]
    Idle,
    /// Verifying existing data on disk
    Preparing,
    /// Waiting for peers from the tracker
    Searching,
    /// Dialing peers
    Connecting,
    /// First peers connected, nothing complete yet
    WarmingUp,
    /// Regular downloading
    Downloading,
    /// Racing the last few pieces across peers
    Endgame,
    /// All pieces complete, uploading only
    Seeding,
    /// Connections dropped by the user, peer list retained
    Paused,
    /// Shutting down, waiting for the tracker
    Stopping,
}

impl TransferState {
    /// States in which peers are connected and scheduling runs
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            Self::Idle | Self::Preparing | Self::Paused | Self::Stopping
        )
    }

    /// States that allow several peers to race for the same piece
    pub fn is_multi_mode(&self) -> bool {
        matches!(self, Self::WarmingUp | Self::Endgame)
    }

    /// Human readable label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Preparing => "Preparing",
            Self::Searching => "Searching",
            Self::Connecting => "Connecting",
            Self::WarmingUp => "Warming up",
            Self::Downloading => "Downloading",
            Self::Endgame => "Finishing",
            Self::Seeding => "Seeding",
            Self::Paused => "Paused",
            Self::Stopping => "Stopping",
        }
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Block request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRequest {
    /// Piece index
    pub piece: u32,
    /// Block offset within piece
    pub offset: u32,
    /// Block length
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }
}

/// Fixed geometry of the torrent content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentLayout {
    /// Total content length in bytes
    pub total_length: u64,
    /// Nominal piece length (last piece may be shorter)
    pub piece_length: u32,
}

impl TorrentLayout {
    /// Create a layout, rejecting empty content and zero piece length
    pub fn new(total_length: u64, piece_length: u32) -> Result<Self> {
        if piece_length == 0 {
            return Err(SwarmError::invalid_input(
                "piece_length",
                "piece length must be non-zero",
            ));
        }
        if total_length == 0 {
            return Err(SwarmError::invalid_input(
                "total_length",
                "torrent has no content",
            ));
        }
        let layout = Self {
            total_length,
            piece_length,
        };
        if layout.piece_count_u64() > u32::MAX as u64 {
            return Err(SwarmError::invalid_input(
                "total_length",
                "too many pieces",
            ));
        }
        Ok(layout)
    }

    fn piece_count_u64(&self) -> u64 {
        self.total_length.div_ceil(self.piece_length as u64)
    }

    /// Number of pieces in the torrent
    pub fn piece_count(&self) -> u32 {
        self.piece_count_u64() as u32
    }

    /// Length of the piece at `index`, `None` if out of range
    pub fn piece_length_at(&self, index: u32) -> Option<u32> {
        if index >= self.piece_count() {
            return None;
        }
        let start = index as u64 * self.piece_length as u64;
        let remaining = self.total_length - start;
        Some(remaining.min(self.piece_length as u64) as u32)
    }
}

/// Peer information for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Connection id
    pub id: PeerId,
    /// Remote address
    pub addr: SocketAddr,
    /// Download speed from this peer (bytes/sec)
    pub download_speed: u64,
    /// Upload speed to this peer (bytes/sec)
    pub upload_speed: u64,
    /// Progress of peer (0.0 - 1.0)
    pub progress: f64,
    /// Whether we're choking them
    pub am_choking: bool,
    /// Whether they're choking us
    pub peer_choking: bool,
    /// Blocks requested from this peer with no answer yet
    pub blocks_in_flight: usize,
}

/// Snapshot of the whole transfer, cheap to clone
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmStatus {
    /// Current phase
    pub state: TransferState,
    /// Completion percentage (0-100)
    pub progress: u32,
    /// Verified pieces
    pub completed_pieces: u32,
    /// Pieces in the torrent
    pub piece_count: u32,
    /// Open connections
    pub connected_peers: usize,
    /// Open connections to complete seeds
    pub seeds: usize,
    /// Payload bytes received
    pub downloaded_bytes: u64,
    /// Payload bytes sent
    pub uploaded_bytes: u64,
    /// Per-connection details
    pub peers: Vec<PeerInfo>,
}
