//! Peer View
//!
//! Scheduling-relevant state for one live peer-wire session: the four wire
//! flags, the pieces the peer advertises, the pieces it is working on for us
//! and the blocks it still owes us.
//!
//! Connections are owned by the orchestrator. Claims, in-flight blocks and
//! choke flags are mutated only by the schedulers.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bitvec::prelude::*;

use super::choking::PeerStats;
use crate::error::{ProtocolErrorKind, Result, SwarmError};
use crate::types::{BlockRequest, PeerId, PeerInfo};

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP established, handshake pending
    Connecting,
    /// Handshake complete, messages flowing
    Connected,
}

/// A live peer-wire session as seen by the schedulers
#[derive(Debug, Clone)]
pub struct PeerConnection {
    id: PeerId,
    addr: SocketAddr,
    state: ConnectionState,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    /// Pieces the peer advertised
    available: BitVec<u8, Msb0>,
    /// Piece indices this peer is working on, in claim order
    claims: Vec<u32>,
    /// Requests sent to this peer with no response yet
    in_flight: Vec<BlockRequest>,

    /// Smoothed rate we upload to the peer (bytes/sec)
    pub upload_rate: u64,
    /// Smoothed rate we download from the peer (bytes/sec)
    pub download_rate: u64,
}

impl PeerConnection {
    /// Create a connection in its initial wire state (both sides choking)
    pub fn new(id: PeerId, addr: SocketAddr, num_pieces: u32) -> Self {
        Self {
            id,
            addr,
            state: ConnectionState::Connecting,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            available: bitvec![u8, Msb0; 0; num_pieces as usize],
            claims: Vec::new(),
            in_flight: Vec::new(),
            upload_rate: 0,
            download_rate: 0,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
    }

    /// Replace the advertised piece set with an initial bitfield.
    ///
    /// Wire bitfields are padded to whole bytes; spare bits must be clear.
    pub fn set_bitfield(&mut self, bitfield: &BitSlice<u8, Msb0>) -> Result<()> {
        let count = self.available.len();
        if bitfield.len() < count || bitfield[count..].any() {
            return Err(SwarmError::protocol(
                ProtocolErrorKind::BitfieldLength,
                format!(
                    "bitfield of {} bits for {} pieces from {}",
                    bitfield.len(),
                    count,
                    self.id
                ),
            ));
        }
        self.available.copy_from_bitslice(&bitfield[..count]);
        Ok(())
    }

    /// Record a single "have" announcement
    pub fn announce_piece(&mut self, index: u32) -> Result<()> {
        if index as usize >= self.available.len() {
            return Err(SwarmError::protocol(
                ProtocolErrorKind::UnknownPiece,
                format!("{} announced piece {} out of range", self.id, index),
            ));
        }
        self.available.set(index as usize, true);
        Ok(())
    }

    pub fn available_pieces(&self) -> &BitSlice<u8, Msb0> {
        &self.available
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.available
            .get(index as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    /// Number of pieces the peer advertised
    pub fn pieces_available(&self) -> u32 {
        self.available.count_ones() as u32
    }

    /// Peer has every piece
    pub fn is_seed(&self) -> bool {
        !self.available.is_empty() && self.available.all()
    }

    /// Whether the peer has any piece set in `wanted`
    pub fn has_any_of(&self, wanted: &BitSlice<u8, Msb0>) -> bool {
        self.available
            .iter_ones()
            .any(|i| wanted.get(i).map(|b| *b).unwrap_or(false))
    }

    pub fn claims(&self) -> &[u32] {
        &self.claims
    }

    pub fn has_claim(&self, index: u32) -> bool {
        self.claims.contains(&index)
    }

    pub(crate) fn add_claim(&mut self, index: u32) {
        if !self.claims.contains(&index) {
            self.claims.push(index);
        }
    }

    pub(crate) fn remove_claim(&mut self, index: u32) -> bool {
        let before = self.claims.len();
        self.claims.retain(|&c| c != index);
        self.claims.len() != before
    }

    pub(crate) fn take_claims(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.claims)
    }

    pub fn in_flight(&self) -> &[BlockRequest] {
        &self.in_flight
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// In-flight requests belonging to one piece
    pub fn in_flight_for(&self, piece: u32) -> impl Iterator<Item = &BlockRequest> {
        self.in_flight.iter().filter(move |r| r.piece == piece)
    }

    /// Is there a request outstanding for the block at `offset` of `piece`
    pub fn is_requested_at(&self, piece: u32, offset: u32) -> bool {
        self.in_flight
            .iter()
            .any(|r| r.piece == piece && r.offset == offset)
    }

    pub(crate) fn push_in_flight(&mut self, request: BlockRequest) {
        self.in_flight.push(request);
    }

    /// Drop the outstanding request for a block, returning it
    pub(crate) fn remove_in_flight(&mut self, piece: u32, offset: u32) -> Option<BlockRequest> {
        let pos = self
            .in_flight
            .iter()
            .position(|r| r.piece == piece && r.offset == offset)?;
        Some(self.in_flight.remove(pos))
    }

    /// Drop every outstanding request for one piece
    pub(crate) fn drain_in_flight_for(&mut self, piece: u32) -> Vec<BlockRequest> {
        let (drained, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|r| r.piece == piece);
        self.in_flight = kept;
        drained
    }

    /// Drop every outstanding request
    pub(crate) fn drain_all_in_flight(&mut self) -> Vec<BlockRequest> {
        std::mem::take(&mut self.in_flight)
    }

    /// Snapshot for the choking algorithm
    pub fn stats(&self) -> PeerStats {
        PeerStats {
            id: self.id,
            addr: self.addr,
            download_rate: self.download_rate,
            upload_rate: self.upload_rate,
            peer_interested: self.peer_interested,
            am_interested: self.am_interested,
            is_unchoked: !self.am_choking,
            is_seeder: self.is_seed(),
            pieces_available: self.pieces_available(),
            blocks_in_flight: self.in_flight.len(),
        }
    }

    /// Display snapshot
    pub fn info(&self) -> PeerInfo {
        let total = self.available.len().max(1) as f64;
        PeerInfo {
            id: self.id,
            addr: self.addr,
            download_speed: self.download_rate,
            upload_speed: self.upload_rate,
            progress: self.pieces_available() as f64 / total,
            am_choking: self.am_choking,
            peer_choking: self.peer_choking,
            blocks_in_flight: self.in_flight.len(),
        }
    }
}

/// All live connections, iterated in id order so seeded runs are reproducible
#[derive(Debug, Clone, Default)]
pub struct PeerSet {
    peers: BTreeMap<PeerId, PeerConnection>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: PeerConnection) {
        self.peers.insert(peer.id(), peer);
    }

    pub fn remove(&mut self, id: PeerId) -> Option<PeerConnection> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerConnection> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut PeerConnection> {
        self.peers.get_mut(&id)
    }

    /// Like `get_mut`, failing with `UnknownPeer`
    pub fn require_mut(&mut self, id: PeerId) -> Result<&mut PeerConnection> {
        self.peers.get_mut(&id).ok_or(SwarmError::UnknownPeer(id))
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerConnection> {
        self.peers.values_mut()
    }

    /// Connections that completed the handshake
    pub fn connected(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values().filter(|p| p.is_connected())
    }

    /// Open connections to the given address
    pub fn connections_to(&self, addr: SocketAddr) -> usize {
        self.peers.values().filter(|p| p.addr() == addr).count()
    }

    /// How many connected peers advertise each piece
    pub fn piece_occurrences(&self, piece_count: u32) -> Vec<u32> {
        let mut occurrences = vec![0u32; piece_count as usize];
        for peer in self.connected() {
            for i in peer.available_pieces().iter_ones() {
                if let Some(count) = occurrences.get_mut(i) {
                    *count += 1;
                }
            }
        }
        occurrences
    }

    /// Whether any peer other than `except` has the block outstanding
    pub fn is_requested_elsewhere(&self, except: PeerId, piece: u32, offset: u32) -> bool {
        self.peers
            .values()
            .any(|p| p.id() != except && p.is_requested_at(piece, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn make_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn test_initial_wire_state() {
        let peer = PeerConnection::new(PeerId(1), make_addr(6881), 8);
        assert!(peer.am_choking);
        assert!(peer.peer_choking);
        assert!(!peer.am_interested);
        assert!(!peer.peer_interested);
        assert_eq!(peer.state(), ConnectionState::Connecting);
        assert_eq!(peer.pieces_available(), 0);
    }

    #[test]
    fn test_padded_bitfield() {
        let mut peer = PeerConnection::new(PeerId(1), make_addr(6881), 10);
        let mut bits = bitvec![u8, Msb0; 0; 16];
        bits.set(0, true);
        bits.set(9, true);
        peer.set_bitfield(&bits).unwrap();
        assert!(peer.has_piece(0));
        assert!(peer.has_piece(9));
        assert_eq!(peer.pieces_available(), 2);

        bits.set(12, true);
        assert!(peer.set_bitfield(&bits).is_err());

        let short = bitvec![u8, Msb0; 1; 8];
        assert!(peer.set_bitfield(&short).is_err());
    }

    #[test]
    fn test_seed_detection() {
        let mut peer = PeerConnection::new(PeerId(1), make_addr(6881), 3);
        for i in 0..3 {
            assert!(!peer.is_seed());
            peer.announce_piece(i).unwrap();
        }
        assert!(peer.is_seed());
        assert!(peer.announce_piece(3).is_err());
    }

    #[test]
    fn test_in_flight_bookkeeping() {
        let mut peer = PeerConnection::new(PeerId(1), make_addr(6881), 4);
        peer.push_in_flight(BlockRequest::new(0, 0, 16384));
        peer.push_in_flight(BlockRequest::new(0, 16384, 16384));
        peer.push_in_flight(BlockRequest::new(2, 0, 16384));
        assert!(peer.is_requested_at(0, 16384));

        assert!(peer.remove_in_flight(0, 0).is_some());
        assert!(peer.remove_in_flight(0, 0).is_none());

        let drained = peer.drain_in_flight_for(0);
        assert_eq!(drained.len(), 1);
        assert_eq!(peer.in_flight_count(), 1);
        assert_eq!(peer.in_flight()[0].piece, 2);
    }

    #[test]
    fn test_piece_occurrences_counts_connected_only() {
        let mut set = PeerSet::new();
        let mut a = PeerConnection::new(PeerId(1), make_addr(1), 3);
        a.mark_connected();
        a.announce_piece(0).unwrap();
        a.announce_piece(1).unwrap();
        let mut b = PeerConnection::new(PeerId(2), make_addr(2), 3);
        b.mark_connected();
        b.announce_piece(1).unwrap();
        let mut c = PeerConnection::new(PeerId(3), make_addr(3), 3);
        c.announce_piece(2).unwrap();
        set.insert(a);
        set.insert(b);
        set.insert(c);

        assert_eq!(set.piece_occurrences(3), vec![1, 2, 0]);
    }
}
