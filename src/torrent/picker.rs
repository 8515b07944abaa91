//! Block Scheduler
//!
//! Decides, for each unchoked peer, which piece it should work on and which
//! blocks to request next.
//!
//! Piece selection, in order:
//! - Warm-up with enough pending pieces: every peer shares the same few pieces.
//! - A partially downloaded piece nobody is working on, so abandoned work is
//!   recovered before new pieces are started.
//! - One in `rarest_pick_one_in` times (always while warming up) a piece with
//!   the extreme availability among connected peers: rarest normally, most
//!   common while warming up. Otherwise a uniformly random candidate.
//!
//! Warm-up and endgame allow several peers to request the same blocks; the
//! first copy to arrive wins and the others are cancelled.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use super::events::{Command, Outbox};
use super::peer::PeerSet;
use super::piece::{BlockOutcome, Piece, PieceTable};
use crate::config::SwarmConfig;
use crate::error::{ProtocolErrorKind, Result, SwarmError};
use crate::types::{PeerId, TransferState};

use bytes::Bytes;

/// Per-peer piece and block scheduler
pub struct BlockScheduler {
    max_blocks_in_progress: usize,
    max_blocks_in_multi_mode: usize,
    warmup_shared_piece_threshold: usize,
    endgame_min_upload_rate: u64,
    rarest_pick_one_in: u32,
    rng: StdRng,
}

impl BlockScheduler {
    pub fn new(config: &SwarmConfig) -> Self {
        Self {
            max_blocks_in_progress: config.max_blocks_in_progress,
            max_blocks_in_multi_mode: config.max_blocks_in_multi_mode,
            warmup_shared_piece_threshold: config.warmup_shared_piece_threshold,
            endgame_min_upload_rate: config.endgame_min_upload_rate,
            rarest_pick_one_in: config.rarest_pick_one_in,
            rng: config.rng(0),
        }
    }

    /// Blocks a single peer may have in flight in `state`
    pub fn block_quota(&self, state: TransferState) -> usize {
        if state.is_multi_mode() {
            self.max_blocks_in_multi_mode
        } else {
            self.max_blocks_in_progress
        }
    }

    /// Run one scheduling pass for every connection
    pub fn schedule_all(
        &mut self,
        table: &mut PieceTable,
        peers: &mut PeerSet,
        state: TransferState,
        out: &mut Outbox,
    ) -> usize {
        peers
            .ids()
            .into_iter()
            .map(|id| self.schedule_for_peer(table, peers, state, id, out))
            .sum()
    }

    /// Fill the request pipeline of one peer.
    ///
    /// Claims at most one new piece per call; if the quota is still not full
    /// afterwards a follow-up pass is requested through the outbox.
    /// Returns the number of block requests issued.
    pub fn schedule_for_peer(
        &mut self,
        table: &mut PieceTable,
        peers: &mut PeerSet,
        state: TransferState,
        id: PeerId,
        out: &mut Outbox,
    ) -> usize {
        if !state.is_active() || state == TransferState::Seeding {
            return 0;
        }
        let Some(peer) = peers.get(id) else {
            return 0;
        };
        if !peer.is_connected() || peer.peer_choking {
            return 0;
        }
        if peer.in_flight_count() >= self.block_quota(state) {
            return 0;
        }

        if state == TransferState::WarmingUp
            && table.pending_len() >= self.warmup_shared_piece_threshold
        {
            if let Some(index) = self.shared_warmup_piece(table, peers, id) {
                self.claim(table, peers, id, index);
                let in_flight_here = peers
                    .get(id)
                    .map(|p| p.in_flight_for(index).count())
                    .unwrap_or(0);
                if table.blocks_remaining(index) as usize <= in_flight_here {
                    return 0;
                }
                return self.request_more(table, peers, state, id, out);
            }
        }

        if !self.has_open_claim(table, peers, state, id) {
            match self.select_piece(table, peers, state, id) {
                Some(index) => {
                    tracing::debug!(peer = %id, piece = index, %state, "claiming piece");
                    self.claim(table, peers, id, index);
                }
                None => {
                    // Starvation is not an error; wait for a "have".
                    tracing::trace!(peer = %id, "no piece available for peer");
                    return 0;
                }
            }
        }

        self.request_more(table, peers, state, id, out)
    }

    /// The warm-up piece this peer shares with the others.
    ///
    /// Reuses the peer's first claim, otherwise picks a random pending piece
    /// the peer can supply.
    fn shared_warmup_piece(
        &mut self,
        table: &PieceTable,
        peers: &PeerSet,
        id: PeerId,
    ) -> Option<u32> {
        let peer = peers.get(id)?;
        if let Some(&index) = peer.claims().first() {
            return Some(index);
        }
        let shared: Vec<u32> = table
            .pending()
            .filter(|p| !p.is_verifying() && peer.has_piece(p.index))
            .map(|p| p.index)
            .collect();
        if shared.is_empty() {
            return None;
        }
        Some(shared[self.rng.random_range(0..shared.len())])
    }

    /// Whether one of the peer's claims still has blocks it could request
    fn has_open_claim(
        &self,
        table: &PieceTable,
        peers: &PeerSet,
        state: TransferState,
        id: PeerId,
    ) -> bool {
        let Some(peer) = peers.get(id) else {
            return false;
        };
        peer.claims().iter().any(|&index| {
            let Some(piece) = table.piece(index) else {
                return false;
            };
            if piece.is_verifying() {
                return false;
            }
            if state.is_multi_mode() {
                piece.incomplete_blocks().into_iter().any(|b| {
                    !peer.is_requested_at(index, piece.block_request(b).offset)
                })
            } else {
                !piece.unrequested_blocks().is_empty()
            }
        })
    }

    /// Choose a new piece for `id`, or `None` if it has nothing we need
    pub fn select_piece(
        &mut self,
        table: &PieceTable,
        peers: &PeerSet,
        state: TransferState,
        id: PeerId,
    ) -> Option<u32> {
        let peer = peers.get(id)?;
        let multi = state.is_multi_mode();
        let allow_shared = state == TransferState::WarmingUp
            || (state == TransferState::Endgame
                && peer.upload_rate >= self.endgame_min_upload_rate);

        let candidates: Vec<u32> = table
            .incomplete_pieces()
            .iter_ones()
            .map(|i| i as u32)
            .filter(|&i| peer.has_piece(i) && !peer.has_claim(i))
            .filter(|&i| match table.piece(i) {
                Some(piece) => !piece.is_verifying() && (allow_shared || !piece.in_progress()),
                None => true,
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        // Recover abandoned work first.
        let partial: Vec<u32> = candidates
            .iter()
            .copied()
            .filter(|&i| {
                table
                    .piece(i)
                    .map(|p| !p.in_progress() || multi)
                    .unwrap_or(false)
            })
            .collect();
        if !partial.is_empty() {
            return Some(partial[self.rng.random_range(0..partial.len())]);
        }

        let by_rarity = state == TransferState::WarmingUp
            || self.rng.random_range(0..self.rarest_pick_one_in) == 0;
        if !by_rarity {
            return Some(candidates[self.rng.random_range(0..candidates.len())]);
        }

        let occurrences = peers.piece_occurrences(table.piece_count());
        let count_of = |i: u32| occurrences.get(i as usize).copied().unwrap_or(0);
        let extreme = if state == TransferState::WarmingUp {
            candidates.iter().map(|&i| count_of(i)).max()
        } else {
            candidates.iter().map(|&i| count_of(i)).min()
        }?;
        let group: Vec<u32> = candidates
            .into_iter()
            .filter(|&i| count_of(i) == extreme)
            .collect();
        Some(group[self.rng.random_range(0..group.len())])
    }

    fn claim(&mut self, table: &mut PieceTable, peers: &mut PeerSet, id: PeerId, index: u32) {
        let Some(peer) = peers.get_mut(id) else {
            return;
        };
        match table.get_or_create(index) {
            Ok(piece) => {
                piece.add_claimant(id);
                peer.add_claim(index);
            }
            Err(e) => tracing::warn!(peer = %id, piece = index, "cannot claim piece: {}", e),
        }
    }

    /// Request blocks from the peer's claims until its quota is full
    fn request_more(
        &mut self,
        table: &mut PieceTable,
        peers: &mut PeerSet,
        state: TransferState,
        id: PeerId,
        out: &mut Outbox,
    ) -> usize {
        let Some(peer) = peers.get(id) else {
            return 0;
        };
        let claims = peer.claims().to_vec();
        let quota = self.block_quota(state);
        let mut in_flight = peer.in_flight_count();

        if claims.is_empty() {
            if table.incomplete_count() > 0 {
                out.want_reschedule();
            }
            return 0;
        }
        if in_flight >= quota {
            return 0;
        }

        let mut issued = 0;
        for index in claims {
            let n = self.request_blocks(table, peers, state, id, index, quota - in_flight, out);
            in_flight += n;
            issued += n;
            if in_flight >= quota {
                break;
            }
        }

        if in_flight < quota && state != TransferState::WarmingUp {
            out.want_reschedule();
        }
        issued
    }

    /// Request up to `max_blocks` blocks of `index` from `id`.
    ///
    /// Only blocks nobody has requested are considered, except while warming
    /// up or in endgame, where any block this peer is not already fetching
    /// may be raced. Returns the number of requests issued.
    #[allow(clippy::too_many_arguments)]
    pub fn request_blocks(
        &mut self,
        table: &mut PieceTable,
        peers: &mut PeerSet,
        state: TransferState,
        id: PeerId,
        index: u32,
        max_blocks: usize,
        out: &mut Outbox,
    ) -> usize {
        let Some(peer) = peers.get_mut(id) else {
            return 0;
        };
        let Some(piece) = table.piece_mut(index) else {
            return 0;
        };
        if piece.is_verifying() {
            return 0;
        }

        let mut blocks = piece.unrequested_blocks();
        if blocks.is_empty() {
            if !state.is_multi_mode() {
                return 0;
            }
            blocks = piece
                .incomplete_blocks()
                .into_iter()
                .filter(|&b| !peer.is_requested_at(index, piece.block_request(b).offset))
                .collect();
        }

        if state.is_multi_mode() {
            // Peers racing the same piece should not all fetch it in the same order.
            blocks.shuffle(&mut self.rng);
        }

        let count = max_blocks.min(blocks.len());
        for &block in &blocks[..count] {
            let request = piece.block_request(block);
            piece.mark_requested(block);
            peer.push_in_flight(request);
            out.push(Command::RequestBlock { peer: id, request });
        }
        if count > 0 {
            tracing::trace!(peer = %id, piece = index, count, "requested blocks");
        }
        count
    }

    /// Handle a block delivered by a peer.
    ///
    /// Empty or malformed payloads are protocol faults; the caller drops the
    /// connection. Late and duplicate blocks are discarded.
    #[allow(clippy::too_many_arguments)]
    pub fn on_block_received(
        &mut self,
        table: &mut PieceTable,
        peers: &mut PeerSet,
        state: TransferState,
        id: PeerId,
        index: u32,
        offset: u32,
        data: Bytes,
        out: &mut Outbox,
    ) -> Result<()> {
        if data.is_empty() {
            return Err(SwarmError::protocol(
                ProtocolErrorKind::EmptyBlock,
                format!("{} sent an empty block for piece {}", id, index),
            ));
        }
        // A rejected block stays in flight so releasing the peer clears it.
        let block = match table.piece(index) {
            Some(piece) => Some(Self::validate_block(piece, offset, data.len())?),
            None => None,
        };
        peers.require_mut(id)?.remove_in_flight(index, offset);

        let (Some(block), Some(piece)) = (block, table.piece(index)) else {
            self.schedule_for_peer(table, peers, state, id, out);
            return Ok(());
        };
        if piece.is_block_complete(block) {
            self.schedule_for_peer(table, peers, state, id, out);
            return Ok(());
        }

        if state.is_multi_mode() {
            for other in peers.iter_mut().filter(|p| p.id() != id) {
                if let Some(request) = other.remove_in_flight(index, offset) {
                    out.push(Command::CancelRequest {
                        peer: other.id(),
                        request,
                    });
                }
            }
        }

        out.push(Command::WriteBlock {
            piece: index,
            offset,
            data,
        });
        if let BlockOutcome::PieceComplete { claimants } = table.mark_block_complete(index, block)? {
            out.push(Command::VerifyPiece(index));
            for claimant in claimants {
                if let Some(p) = peers.get_mut(claimant) {
                    p.remove_claim(index);
                }
            }
            // Anything still outstanding for this piece is a duplicate now.
            for other in peers.iter_mut() {
                for request in other.drain_in_flight_for(index) {
                    out.push(Command::CancelRequest {
                        peer: other.id(),
                        request,
                    });
                }
            }
        }

        self.schedule_for_peer(table, peers, state, id, out);
        Ok(())
    }

    /// Block index for `offset`, if a payload of `len` bytes fits it exactly
    fn validate_block(piece: &Piece, offset: u32, len: usize) -> Result<u32> {
        let block = piece.block_index(offset).ok_or_else(|| {
            SwarmError::protocol(
                ProtocolErrorKind::BadOffset,
                format!("offset {} invalid for piece {}", offset, piece.index),
            )
        })?;
        if len != piece.block_length(block) as usize {
            return Err(SwarmError::protocol(
                ProtocolErrorKind::BadLength,
                format!(
                    "block {} of piece {} has {} bytes, expected {}",
                    block,
                    piece.index,
                    len,
                    piece.block_length(block)
                ),
            ));
        }
        Ok(block)
    }

    /// Drop every claim and outstanding request of a peer.
    ///
    /// Used when the peer chokes us or disconnects; the blocks become
    /// requestable by other peers right away.
    pub fn release_peer(&mut self, table: &mut PieceTable, peers: &mut PeerSet, id: PeerId) {
        let Some(peer) = peers.get_mut(id) else {
            return;
        };
        let mut touched = peer.take_claims();
        let in_flight = peer.drain_all_in_flight();
        for request in &in_flight {
            if !touched.contains(&request.piece) {
                touched.push(request.piece);
            }
        }

        for index in touched {
            let Some(piece) = table.piece_mut(index) else {
                continue;
            };
            piece.remove_claimant(id);
            for request in in_flight.iter().filter(|r| r.piece == index) {
                if peers.is_requested_elsewhere(id, index, request.offset) {
                    continue;
                }
                if let Some(block) = piece.block_index(request.offset) {
                    piece.clear_requested(block);
                }
            }
        }
        tracing::debug!(peer = %id, released = in_flight.len(), "released peer claims");
    }

    /// Remove a piece from every peer's claim list
    pub fn detach_piece(&mut self, peers: &mut PeerSet, index: u32) {
        for peer in peers.iter_mut() {
            peer.remove_claim(index);
        }
    }
}
