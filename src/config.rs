//! Swarm configuration
//!
//! Tunables for the block scheduler, the choking algorithm and the peer
//! connector. Every field has a serde default so partial configs load.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};

/// Default block size (16KB)
pub const BLOCK_SIZE: u32 = 16384;

/// Main configuration for the swarm engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Size of a wire-level block request in bytes
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Blocks in flight per peer in normal mode
    #[serde(default = "default_max_blocks_in_progress")]
    pub max_blocks_in_progress: usize,

    /// Blocks in flight per peer while warming up or in endgame
    #[serde(default = "default_max_blocks_in_multi_mode")]
    pub max_blocks_in_multi_mode: usize,

    /// Pending pieces needed before warm-up steers all peers to shared pieces
    #[serde(default = "default_warmup_shared_piece_threshold")]
    pub warmup_shared_piece_threshold: usize,

    /// Endgame starts when fewer than this many pieces are incomplete
    #[serde(default = "default_endgame_piece_threshold")]
    pub endgame_piece_threshold: usize,

    /// In endgame, only peers we upload to at least this fast (bytes/sec)
    /// may race for pieces claimed by someone else
    #[serde(default = "default_endgame_min_upload_rate")]
    pub endgame_min_upload_rate: u64,

    /// One in N fresh piece selections uses rarity instead of a uniform pick
    #[serde(default = "default_rarest_pick_one_in")]
    pub rarest_pick_one_in: u32,

    /// Regular unchoke slots
    #[serde(default = "default_max_uploads")]
    pub max_uploads: usize,

    /// Seconds between choke rebalances
    #[serde(default = "default_upload_schedule_interval_secs")]
    pub upload_schedule_interval_secs: u64,

    /// One in N interested peers losing their slot is disconnected instead of choked
    #[serde(default = "default_choke_drop_one_in")]
    pub choke_drop_one_in: u32,

    /// Maximum open connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum open connections to the same address
    #[serde(default = "default_max_connections_per_peer")]
    pub max_connections_per_peer: usize,

    /// Seconds before a known peer may be dialed again
    #[serde(default = "default_min_revisit_secs")]
    pub min_revisit_secs: u64,

    /// Connect times at or above this many seconds earn no speed bonus
    #[serde(default = "default_fast_connect_secs")]
    pub fast_connect_secs: u64,

    /// Known-peer list is capped at `max_connections * known_peer_factor`
    #[serde(default = "default_known_peer_factor")]
    pub known_peer_factor: usize,

    /// Seed for every random decision; `None` draws from OS entropy
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

fn default_block_size() -> u32 {
    BLOCK_SIZE
}

fn default_max_blocks_in_progress() -> usize {
    5
}

fn default_max_blocks_in_multi_mode() -> usize {
    2
}

fn default_warmup_shared_piece_threshold() -> usize {
    4
}

fn default_endgame_piece_threshold() -> usize {
    5
}

fn default_endgame_min_upload_rate() -> u64 {
    1024
}

fn default_rarest_pick_one_in() -> u32 {
    4
}

fn default_max_uploads() -> usize {
    4
}

fn default_upload_schedule_interval_secs() -> u64 {
    10
}

fn default_choke_drop_one_in() -> u32 {
    10
}

fn default_max_connections() -> usize {
    50
}

fn default_max_connections_per_peer() -> usize {
    1
}

fn default_min_revisit_secs() -> u64 {
    30
}

fn default_fast_connect_secs() -> u64 {
    5
}

fn default_known_peer_factor() -> usize {
    3
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            max_blocks_in_progress: default_max_blocks_in_progress(),
            max_blocks_in_multi_mode: default_max_blocks_in_multi_mode(),
            warmup_shared_piece_threshold: default_warmup_shared_piece_threshold(),
            endgame_piece_threshold: default_endgame_piece_threshold(),
            endgame_min_upload_rate: default_endgame_min_upload_rate(),
            rarest_pick_one_in: default_rarest_pick_one_in(),
            max_uploads: default_max_uploads(),
            upload_schedule_interval_secs: default_upload_schedule_interval_secs(),
            choke_drop_one_in: default_choke_drop_one_in(),
            max_connections: default_max_connections(),
            max_connections_per_peer: default_max_connections_per_peer(),
            min_revisit_secs: default_min_revisit_secs(),
            fast_connect_secs: default_fast_connect_secs(),
            known_peer_factor: default_known_peer_factor(),
            rng_seed: None,
        }
    }
}

impl SwarmConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(SwarmError::invalid_input(
                "block_size",
                "block size must be non-zero",
            ));
        }
        if self.max_blocks_in_progress == 0 {
            return Err(SwarmError::invalid_input(
                "max_blocks_in_progress",
                "must allow at least one block in flight",
            ));
        }
        if self.max_blocks_in_multi_mode == 0 {
            return Err(SwarmError::invalid_input(
                "max_blocks_in_multi_mode",
                "must allow at least one block in flight",
            ));
        }
        if self.rarest_pick_one_in == 0 {
            return Err(SwarmError::invalid_input(
                "rarest_pick_one_in",
                "must be at least 1",
            ));
        }
        if self.choke_drop_one_in == 0 {
            return Err(SwarmError::invalid_input(
                "choke_drop_one_in",
                "must be at least 1",
            ));
        }
        if self.upload_schedule_interval_secs == 0 {
            return Err(SwarmError::invalid_input(
                "upload_schedule_interval_secs",
                "choke interval must be non-zero",
            ));
        }
        if self.max_connections_per_peer == 0 {
            return Err(SwarmError::invalid_input(
                "max_connections_per_peer",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Interval between choke rebalances
    pub fn upload_schedule_interval(&self) -> Duration {
        Duration::from_secs(self.upload_schedule_interval_secs)
    }

    /// Interval before a known peer may be dialed again
    pub fn min_revisit(&self) -> Duration {
        Duration::from_secs(self.min_revisit_secs)
    }

    /// Upper bound on the known-peer list
    pub fn max_known_peers(&self) -> usize {
        self.max_connections.saturating_mul(self.known_peer_factor)
    }

    /// Random source for one scheduler.
    ///
    /// With a fixed seed each `stream` gets its own reproducible sequence.
    pub fn rng(&self, stream: u64) -> StdRng {
        match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
            None => StdRng::from_os_rng(),
        }
    }
}
