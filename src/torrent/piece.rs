//! Piece Table
//!
//! Authoritative record of piece and block completion. Pieces that have been
//! claimed or partially received live in the pending map; verified pieces are
//! tracked only as a bit in the completed bitfield.
//!
//! The table is owned by the scheduling task and mutated only through the
//! block scheduler.

use std::collections::{BTreeMap, BTreeSet};

use bitvec::prelude::*;

use crate::error::{ProtocolErrorKind, Result, SwarmError};
use crate::types::{BlockRequest, PeerId, TorrentLayout};

/// A piece being downloaded
#[derive(Debug, Clone)]
pub struct Piece {
    /// Piece index
    pub index: u32,
    /// Piece length in bytes
    pub length: u32,
    /// Block size used
    block_size: u32,
    /// Blocks received and written
    completed_blocks: BitVec<u8, Msb0>,
    /// Blocks outstanding from some peer
    requested_blocks: BitVec<u8, Msb0>,
    /// Some peer holds a claim on this piece
    in_progress: bool,
    /// All blocks received, waiting for the checksum result
    verifying: bool,
    /// Peers currently claiming this piece
    claimants: BTreeSet<PeerId>,
}

impl Piece {
    /// Create an empty piece
    pub fn new(index: u32, length: u32, block_size: u32) -> Self {
        let num_blocks = length.div_ceil(block_size) as usize;
        Self {
            index,
            length,
            block_size,
            completed_blocks: bitvec![u8, Msb0; 0; num_blocks],
            requested_blocks: bitvec![u8, Msb0; 0; num_blocks],
            in_progress: false,
            verifying: false,
            claimants: BTreeSet::new(),
        }
    }

    /// Number of blocks in this piece
    pub fn block_count(&self) -> u32 {
        self.completed_blocks.len() as u32
    }

    /// Map a byte offset to a block index.
    ///
    /// Returns `None` if the offset is unaligned or past the end.
    pub fn block_index(&self, offset: u32) -> Option<u32> {
        if offset % self.block_size != 0 {
            return None;
        }
        let index = offset / self.block_size;
        (index < self.block_count()).then_some(index)
    }

    /// Expected length of a block (last block may be smaller)
    pub fn block_length(&self, block: u32) -> u32 {
        let offset = block * self.block_size;
        self.block_size.min(self.length.saturating_sub(offset))
    }

    /// Wire request for a block of this piece
    pub fn block_request(&self, block: u32) -> BlockRequest {
        BlockRequest::new(self.index, block * self.block_size, self.block_length(block))
    }

    pub fn is_block_complete(&self, block: u32) -> bool {
        self.completed_blocks
            .get(block as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    pub fn is_block_requested(&self, block: u32) -> bool {
        self.requested_blocks
            .get(block as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    /// Number of blocks not yet received
    pub fn blocks_remaining(&self) -> u32 {
        self.completed_blocks.count_zeros() as u32
    }

    /// Check if all blocks have been received
    pub fn is_complete(&self) -> bool {
        self.completed_blocks.all()
    }

    /// Whether any block has been received
    pub fn has_data(&self) -> bool {
        self.completed_blocks.any()
    }

    /// Blocks neither received nor requested
    pub fn unrequested_blocks(&self) -> Vec<u32> {
        (0..self.block_count())
            .filter(|&b| !self.is_block_complete(b) && !self.is_block_requested(b))
            .collect()
    }

    /// Blocks not yet received, requested or not
    pub fn incomplete_blocks(&self) -> Vec<u32> {
        self.completed_blocks.iter_zeros().map(|b| b as u32).collect()
    }

    /// Mark a block as requested.
    ///
    /// Completed blocks are never marked; returns whether the bit was set.
    pub fn mark_requested(&mut self, block: u32) -> bool {
        if block >= self.block_count() || self.is_block_complete(block) {
            return false;
        }
        self.requested_blocks.set(block as usize, true);
        true
    }

    /// Forget an outstanding request
    pub fn clear_requested(&mut self, block: u32) {
        if block < self.block_count() {
            self.requested_blocks.set(block as usize, false);
        }
    }

    /// Record a received block; returns `false` if it was already complete
    fn complete_block(&mut self, block: u32) -> bool {
        if self.is_block_complete(block) {
            return false;
        }
        self.completed_blocks.set(block as usize, true);
        self.requested_blocks.set(block as usize, false);
        true
    }

    /// Drop all progress after a failed checksum
    fn reset(&mut self) {
        self.completed_blocks.fill(false);
        self.requested_blocks.fill(false);
        self.in_progress = false;
        self.verifying = false;
        self.claimants.clear();
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn is_verifying(&self) -> bool {
        self.verifying
    }

    pub fn claimants(&self) -> &BTreeSet<PeerId> {
        &self.claimants
    }

    pub fn completed_blocks(&self) -> &BitSlice<u8, Msb0> {
        &self.completed_blocks
    }

    pub fn requested_blocks(&self) -> &BitSlice<u8, Msb0> {
        &self.requested_blocks
    }

    /// Register `peer` as working on this piece
    pub fn add_claimant(&mut self, peer: PeerId) {
        self.claimants.insert(peer);
        self.in_progress = true;
    }

    /// Remove `peer`; the piece stops being in progress once nobody claims it
    pub fn remove_claimant(&mut self, peer: PeerId) {
        self.claimants.remove(&peer);
        if self.claimants.is_empty() {
            self.in_progress = false;
        }
    }
}

/// Lifecycle phase of a single piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiecePhase {
    /// Incomplete and nobody is working on it (may hold partial data)
    Unclaimed,
    /// Incomplete and claimed by at least one peer
    Claimed,
    /// All blocks received, checksum outstanding
    Verifying,
    /// Verified and written
    Completed,
}

/// Result of recording a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Block was already complete, or the piece is not pending
    Duplicate,
    /// Block stored, piece still has blocks missing
    Stored,
    /// Last block stored; the piece now awaits verification.
    /// Carries the peers whose claims must be detached.
    PieceComplete { claimants: Vec<PeerId> },
}

/// Result of a verification report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Piece is now complete
    Verified { claimants: Vec<PeerId> },
    /// Piece state was reset and it can be scheduled again
    Failed { claimants: Vec<PeerId> },
    /// Report for a piece that was not pending
    Ignored,
}

/// Piece table for a torrent
#[derive(Debug, Clone)]
pub struct PieceTable {
    layout: TorrentLayout,
    block_size: u32,
    /// Bitfield of verified pieces
    completed: BitVec<u8, Msb0>,
    /// Complement of `completed`, kept in sync explicitly
    incomplete: BitVec<u8, Msb0>,
    /// Pieces with a claim or partial data, keyed by index
    pending: BTreeMap<u32, Piece>,
}

impl PieceTable {
    /// Create a table with nothing completed
    pub fn new(layout: TorrentLayout, block_size: u32) -> Self {
        let count = layout.piece_count() as usize;
        Self {
            layout,
            block_size,
            completed: bitvec![u8, Msb0; 0; count],
            incomplete: bitvec![u8, Msb0; 1; count],
            pending: BTreeMap::new(),
        }
    }

    pub fn layout(&self) -> &TorrentLayout {
        &self.layout
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Get the number of pieces
    pub fn piece_count(&self) -> u32 {
        self.completed.len() as u32
    }

    pub fn completed_count(&self) -> u32 {
        self.completed.count_ones() as u32
    }

    pub fn incomplete_count(&self) -> u32 {
        self.incomplete.count_ones() as u32
    }

    /// Check if every piece is verified
    pub fn is_finished(&self) -> bool {
        self.incomplete.not_any()
    }

    /// Completion percentage, 0-100
    pub fn progress_percent(&self) -> u32 {
        if self.piece_count() == 0 {
            return 0;
        }
        ((self.completed_count() as u64 * 100) / self.piece_count() as u64) as u32
    }

    /// Check if we have a piece
    pub fn have_piece(&self, index: u32) -> bool {
        self.completed
            .get(index as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    pub fn completed_pieces(&self) -> &BitSlice<u8, Msb0> {
        &self.completed
    }

    pub fn incomplete_pieces(&self) -> &BitSlice<u8, Msb0> {
        &self.incomplete
    }

    /// Number of pending pieces
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Pending pieces in index order
    pub fn pending(&self) -> impl Iterator<Item = &Piece> {
        self.pending.values()
    }

    pub fn piece(&self, index: u32) -> Option<&Piece> {
        self.pending.get(&index)
    }

    pub fn piece_mut(&mut self, index: u32) -> Option<&mut Piece> {
        self.pending.get_mut(&index)
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.piece_count() {
            return Err(SwarmError::PieceOutOfRange {
                index,
                count: self.piece_count(),
            });
        }
        Ok(())
    }

    /// Fetch the pending entry for `index`, creating it on first use.
    ///
    /// At most one `Piece` exists per index; completed pieces are rejected.
    pub fn get_or_create(&mut self, index: u32) -> Result<&mut Piece> {
        self.check_index(index)?;
        if self.have_piece(index) {
            return Err(SwarmError::Internal(format!(
                "piece {} is already complete",
                index
            )));
        }
        let length = self
            .layout
            .piece_length_at(index)
            .ok_or(SwarmError::PieceOutOfRange {
                index,
                count: self.piece_count(),
            })?;
        let block_size = self.block_size;
        Ok(self
            .pending
            .entry(index)
            .or_insert_with(|| Piece::new(index, length, block_size)))
    }

    /// Where a piece is in its lifecycle
    pub fn phase(&self, index: u32) -> Option<PiecePhase> {
        if index >= self.piece_count() {
            return None;
        }
        if self.have_piece(index) {
            return Some(PiecePhase::Completed);
        }
        Some(match self.pending.get(&index) {
            Some(piece) if piece.verifying => PiecePhase::Verifying,
            Some(piece) if piece.in_progress => PiecePhase::Claimed,
            _ => PiecePhase::Unclaimed,
        })
    }

    /// Blocks still missing from a piece; a piece with no entry is entirely missing
    pub fn blocks_remaining(&self, index: u32) -> u32 {
        if self.have_piece(index) {
            return 0;
        }
        match self.pending.get(&index) {
            Some(piece) => piece.blocks_remaining(),
            None => self
                .layout
                .piece_length_at(index)
                .map(|len| len.div_ceil(self.block_size))
                .unwrap_or(0),
        }
    }

    /// Record a received block.
    ///
    /// When the last block lands the piece is marked as verifying and
    /// detached from all claimants, which are returned so the caller can
    /// drop the claims from the peers as well.
    pub fn mark_block_complete(&mut self, index: u32, block: u32) -> Result<BlockOutcome> {
        self.check_index(index)?;
        let Some(piece) = self.pending.get_mut(&index) else {
            return Ok(BlockOutcome::Duplicate);
        };
        if block >= piece.block_count() {
            return Err(SwarmError::protocol(
                ProtocolErrorKind::BadOffset,
                format!("block {} out of range for piece {}", block, index),
            ));
        }
        if !piece.complete_block(block) {
            return Ok(BlockOutcome::Duplicate);
        }
        if !piece.is_complete() {
            return Ok(BlockOutcome::Stored);
        }

        piece.verifying = true;
        piece.in_progress = false;
        piece.requested_blocks.fill(false);
        let claimants = std::mem::take(&mut piece.claimants).into_iter().collect();
        tracing::debug!(piece = index, "all blocks received, requesting verification");
        Ok(BlockOutcome::PieceComplete { claimants })
    }

    /// Apply a checksum result.
    ///
    /// Success moves the piece into the completed set; failure wipes both
    /// block bitfields so normal scheduling fetches it again.
    pub fn on_verified(&mut self, index: u32, ok: bool) -> Result<VerifyOutcome> {
        self.check_index(index)?;
        if self.have_piece(index) {
            return Ok(VerifyOutcome::Ignored);
        }

        if ok {
            let claimants = self
                .pending
                .remove(&index)
                .map(|p| p.claimants.into_iter().collect())
                .unwrap_or_default();
            self.completed.set(index as usize, true);
            self.incomplete.set(index as usize, false);
            return Ok(VerifyOutcome::Verified { claimants });
        }

        match self.pending.get_mut(&index) {
            Some(piece) => {
                let claimants = piece.claimants.iter().copied().collect();
                piece.reset();
                tracing::warn!(piece = index, "piece failed verification, rescheduling");
                Ok(VerifyOutcome::Failed { claimants })
            }
            None => Ok(VerifyOutcome::Ignored),
        }
    }

    /// Replace the completed set after a full on-disk verification.
    ///
    /// Pending entries that turned out to be complete are dropped. Entries
    /// holding every block that the check did not confirm, and that have no
    /// hash check of their own outstanding, start over.
    pub fn set_completed_pieces(&mut self, completed: &BitSlice<u8, Msb0>) -> Result<()> {
        if completed.len() != self.completed.len() {
            return Err(SwarmError::invalid_input(
                "completed_pieces",
                format!(
                    "bitfield has {} bits, torrent has {} pieces",
                    completed.len(),
                    self.completed.len()
                ),
            ));
        }
        self.completed.copy_from_bitslice(completed);
        self.incomplete = !completed.to_bitvec();

        let done = &self.completed;
        self.pending.retain(|index, _| !done[*index as usize]);
        for piece in self.pending.values_mut() {
            if piece.is_complete() && !piece.verifying {
                tracing::debug!(piece = piece.index, "stored piece unconfirmed, refetching");
                piece.reset();
            }
        }
        Ok(())
    }

    /// Insert a partially downloaded piece recovered from a resume snapshot.
    ///
    /// A piece listing every block is rejected: only a hash check can
    /// complete it, and nothing would schedule one.
    pub fn restore_partial(&mut self, index: u32, completed_blocks: &[u32]) -> Result<()> {
        let existed = self.pending.contains_key(&index);
        let piece = self.get_or_create(index)?;
        let mut blocks = bitvec![u8, Msb0; 0; piece.block_count() as usize];
        for &block in completed_blocks {
            if block >= piece.block_count() {
                if !existed {
                    self.pending.remove(&index);
                }
                return Err(SwarmError::Resume(format!(
                    "block {} out of range for piece {}",
                    block, index
                )));
            }
            blocks.set(block as usize, true);
        }
        if blocks.all() {
            if !existed {
                self.pending.remove(&index);
            }
            return Err(SwarmError::Resume(format!(
                "piece {} lists every block as stored",
                index
            )));
        }

        for block in blocks.iter_ones() {
            piece.complete_block(block as u32);
        }
        piece.in_progress = false;
        Ok(())
    }
}
