//! Resume snapshot
//!
//! Serializable record of which pieces are verified and which blocks of
//! unfinished pieces are already on disk, so a restarted session does not
//! refetch them.

use serde::{Deserialize, Serialize};

use super::piece::PieceTable;
use crate::error::{Result, SwarmError};

/// Current snapshot format
pub const RESUME_VERSION: u32 = 1;

/// Blocks already stored for an unfinished piece
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialPiece {
    pub index: u32,
    /// Piece length in bytes
    pub length: u32,
    pub completed_blocks: Vec<u32>,
}

/// Persistable download progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub version: u32,
    pub piece_count: u32,
    /// Indices of verified pieces
    pub completed_pieces: Vec<u32>,
    pub partial_pieces: Vec<PartialPiece>,
}

impl ResumeState {
    /// Capture the table's progress.
    ///
    /// Only pieces with some, but not all, blocks stored are recorded as
    /// partial; fully received pieces still awaiting verification are left
    /// for the next verification run.
    pub fn capture(table: &PieceTable) -> Self {
        let completed_pieces = table
            .completed_pieces()
            .iter_ones()
            .map(|i| i as u32)
            .collect();
        let partial_pieces = table
            .pending()
            .filter(|p| p.has_data() && !p.is_complete())
            .map(|p| PartialPiece {
                index: p.index,
                length: p.length,
                completed_blocks: p.completed_blocks().iter_ones().map(|b| b as u32).collect(),
            })
            .collect();
        Self {
            version: RESUME_VERSION,
            piece_count: table.piece_count(),
            completed_pieces,
            partial_pieces,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Restore partial pieces into a fresh table.
    ///
    /// Verified pieces are not trusted blindly; they come back through the
    /// on-disk verification. Restored pieces are left unclaimed.
    pub fn apply_partials(&self, table: &mut PieceTable) -> Result<()> {
        self.check(table)?;
        for partial in &self.partial_pieces {
            if table.have_piece(partial.index) {
                continue;
            }
            let expected = table.layout().piece_length_at(partial.index);
            if expected != Some(partial.length) {
                return Err(SwarmError::Resume(format!(
                    "piece {} length {} does not match the torrent",
                    partial.index, partial.length
                )));
            }
            table.restore_partial(partial.index, &partial.completed_blocks)?;
        }
        tracing::debug!(partial = self.partial_pieces.len(), "restored partial pieces");
        Ok(())
    }

    fn check(&self, table: &PieceTable) -> Result<()> {
        if self.version != RESUME_VERSION {
            return Err(SwarmError::Resume(format!(
                "unsupported snapshot version {}",
                self.version
            )));
        }
        if self.piece_count != table.piece_count() {
            return Err(SwarmError::Resume(format!(
                "snapshot has {} pieces, torrent has {}",
                self.piece_count,
                table.piece_count()
            )));
        }
        if let Some(&bad) = self
            .completed_pieces
            .iter()
            .find(|&&i| i >= table.piece_count())
        {
            return Err(SwarmError::Resume(format!("piece {} out of range", bad)));
        }
        Ok(())
    }
}
