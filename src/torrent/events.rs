//! Swarm events and commands
//!
//! Everything that reaches the scheduling task arrives as a [`SwarmEvent`];
//! everything it wants done elsewhere leaves as a [`Command`]. Handlers are
//! plain functions from (state, event) to commands, which keeps the core free
//! of I/O and easy to drive from tests.

use std::net::SocketAddr;

use bitvec::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{BlockRequest, PeerId, TransferState};

/// Input to the scheduling task
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    /// Begin the session (verification of existing data first)
    Start,
    /// Abort all connections and shut down
    Stop,
    /// Drop connections but keep the peer list
    Pause,
    /// Resume after a pause
    Resume,

    /// File service finished checking the data already on disk
    VerificationDone { completed: BitVec<u8, Msb0> },
    /// File service checked a freshly downloaded piece
    PieceVerified { piece: u32, ok: bool },
    /// File service read a block we owe a peer
    BlockRead {
        peer: PeerId,
        piece: u32,
        offset: u32,
        data: Bytes,
    },
    /// File service failed
    FileError { message: String },

    /// Tracker delivered peer addresses
    PeersDiscovered(Vec<SocketAddr>),
    /// Tracker acknowledged the stop announce
    TrackerStopped,

    /// A TCP connection was established (outbound dial or inbound accept)
    PeerConnected {
        peer: PeerId,
        addr: SocketAddr,
        outbound: bool,
    },
    /// An outbound dial failed
    ConnectFailed { addr: SocketAddr, refused: bool },
    /// Peer handshake finished
    HandshakeComplete(PeerId),
    /// Initial bitfield
    PiecesAdvertised {
        peer: PeerId,
        bitfield: BitVec<u8, Msb0>,
    },
    /// "have" message
    PieceAnnounced { peer: PeerId, piece: u32 },
    /// Peer asks us for a block
    BlockRequested { peer: PeerId, request: BlockRequest },
    /// Peer delivered a block
    BlockReceived {
        peer: PeerId,
        piece: u32,
        offset: u32,
        data: Bytes,
    },
    /// Peer choked us
    Choked(PeerId),
    /// Peer unchoked us
    Unchoked(PeerId),
    /// Peer is interested in our pieces
    Interested(PeerId),
    /// Peer lost interest
    NotInterested(PeerId),
    /// Rate estimator update
    RatesUpdated {
        peer: PeerId,
        upload_rate: u64,
        download_rate: u64,
    },
    /// Connection closed
    Disconnected(PeerId),

    /// Debounced download scheduling pass
    ScheduleTick,
    /// Debounced peer connector pass
    ConnectTick,
    /// Periodic choke rebalance
    ChokeTick,
}

/// Output of the scheduling task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    // Peer-wire layer
    SendInterested(PeerId),
    SendNotInterested(PeerId),
    SendBitfield {
        peer: PeerId,
        bitfield: BitVec<u8, Msb0>,
    },
    SendHave {
        peer: PeerId,
        piece: u32,
    },
    RequestBlock {
        peer: PeerId,
        request: BlockRequest,
    },
    CancelRequest {
        peer: PeerId,
        request: BlockRequest,
    },
    SendBlock {
        peer: PeerId,
        piece: u32,
        offset: u32,
        data: Bytes,
    },
    ChokePeer(PeerId),
    UnchokePeer(PeerId),
    Disconnect(PeerId),
    Connect(SocketAddr),

    // File service
    StartVerification,
    WriteBlock {
        piece: u32,
        offset: u32,
        data: Bytes,
    },
    VerifyPiece(u32),
    ReadBlock {
        peer: PeerId,
        request: BlockRequest,
    },

    // Tracker
    TrackerStart,
    TrackerStartSeeding,
    TrackerStop,

    // Debounced self-triggers
    Reschedule,
    ConnectPeers,
}

/// Notifications for observers of the transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SwarmNotice {
    /// Phase changed
    StateChanged {
        old_state: TransferState,
        new_state: TransferState,
    },
    /// Completion percentage changed
    Progress(u32),
    /// Set of connections or their details changed
    PeerInfoUpdated,
    /// Shutdown finished
    Stopped,
    /// File service reported a failure; the transfer was paused
    FileError(String),
}

/// Commands and notices produced while handling one event
#[derive(Debug, Default)]
pub struct Outbox {
    pub commands: Vec<Command>,
    pub notices: Vec<SwarmNotice>,
    /// Some peer still has request quota left; run another scheduling pass
    pub reschedule: bool,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn notify(&mut self, notice: SwarmNotice) {
        self.notices.push(notice);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.notices.is_empty()
    }

    /// Ask for a follow-up scheduling pass
    pub fn want_reschedule(&mut self) {
        self.reschedule = true;
    }

    /// Cancels sent to one peer, in order
    pub fn cancels_for(&self, peer: PeerId) -> Vec<BlockRequest> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::CancelRequest { peer: p, request } if *p == peer => Some(*request),
                _ => None,
            })
            .collect()
    }

    /// Block requests issued to one peer, in order
    pub fn requests_for(&self, peer: PeerId) -> Vec<BlockRequest> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::RequestBlock { peer: p, request } if *p == peer => Some(*request),
                _ => None,
            })
            .collect()
    }

    /// Move everything out, leaving the outbox empty
    pub fn take(&mut self) -> Outbox {
        std::mem::take(self)
    }
}
