//! Choking algorithm for upload slot management.
//!
//! Runs on a fixed interval, independent of download scheduling:
//! - Seeds are left out; there is nothing to gain from unchoking them
//! - Remaining peers are ranked by download rate while leeching, or by
//!   upload rate while seeding
//! - The top `max_uploads` peers are unchoked
//! - Every other peer we are not already choking gets choked; an interested
//!   one is occasionally disconnected instead so it cannot squat on a slot
//! - One random peer that is still choked but interested gets an
//!   optimistic unchoke

use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::SwarmConfig;
use crate::types::PeerId;

/// Peer statistics used for choking decisions and display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerStats {
    /// Connection id.
    pub id: PeerId,
    /// Peer address.
    pub addr: SocketAddr,
    /// Download rate from this peer (bytes/sec).
    pub download_rate: u64,
    /// Upload rate to this peer (bytes/sec).
    pub upload_rate: u64,
    /// Is this peer interested in our pieces?
    pub peer_interested: bool,
    /// Are we interested in this peer's pieces?
    pub am_interested: bool,
    /// Is this peer currently unchoked by us?
    pub is_unchoked: bool,
    /// Is this peer a seeder?
    pub is_seeder: bool,
    /// Pieces the peer advertised.
    pub pieces_available: u32,
    /// Our requests the peer has not answered yet.
    pub blocks_in_flight: usize,
}

/// Decision to choke, unchoke or drop a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokingDecision {
    /// Unchoke this peer.
    Unchoke(PeerId),
    /// Choke this peer.
    Choke(PeerId),
    /// Close the connection instead of choking.
    Disconnect(PeerId),
}

/// Manages the choking algorithm for a torrent.
pub struct ChokingManager {
    /// Regular unchoke slots.
    max_uploads: usize,
    /// One in N interested peers losing their slot is dropped.
    drop_one_in: u32,
    /// Peer picked by the last optimistic unchoke.
    optimistic_peer: Option<PeerId>,
    rng: StdRng,
}

impl ChokingManager {
    /// Create a new choking manager from the swarm configuration.
    pub fn new(config: &SwarmConfig) -> Self {
        Self {
            max_uploads: config.max_uploads,
            drop_one_in: config.choke_drop_one_in,
            optimistic_peer: None,
            rng: config.rng(1),
        }
    }

    /// Decide which peers get upload slots.
    ///
    /// `peers` should list connected peers only. Decisions are returned in
    /// the order they should be applied; peers whose state does not change
    /// get no decision.
    pub fn rebalance(&mut self, peers: &[PeerStats], is_seeding: bool) -> Vec<ChokingDecision> {
        let mut ranked: Vec<&PeerStats> = peers.iter().filter(|p| !p.is_seeder).collect();
        // Stable sort, so equal rates keep id order.
        ranked.sort_by(|a, b| {
            let (ra, rb) = if is_seeding {
                (a.upload_rate, b.upload_rate)
            } else {
                (a.download_rate, b.download_rate)
            };
            rb.cmp(&ra).then(a.id.cmp(&b.id))
        });

        let mut decisions = Vec::new();
        let mut optimistic_pool = Vec::new();

        for (rank, stats) in ranked.iter().enumerate() {
            if rank < self.max_uploads {
                if !stats.is_unchoked {
                    decisions.push(ChokingDecision::Unchoke(stats.id));
                }
                continue;
            }

            if stats.is_unchoked {
                if stats.peer_interested && self.rng.random_range(0..self.drop_one_in) == 0 {
                    tracing::debug!(peer = %stats.id, "dropping interested peer instead of choking");
                    decisions.push(ChokingDecision::Disconnect(stats.id));
                } else {
                    decisions.push(ChokingDecision::Choke(stats.id));
                }
                continue;
            }

            if stats.peer_interested {
                optimistic_pool.push(stats.id);
            }
        }

        self.optimistic_peer = None;
        if !optimistic_pool.is_empty() {
            let id = optimistic_pool[self.rng.random_range(0..optimistic_pool.len())];
            tracing::debug!(peer = %id, "optimistic unchoke");
            decisions.push(ChokingDecision::Unchoke(id));
            self.optimistic_peer = Some(id);
        }

        decisions
    }

    /// Get the current optimistic unchoke peer.
    pub fn optimistic_peer(&self) -> Option<PeerId> {
        self.optimistic_peer
    }

    /// Check if a peer is the optimistic unchoke.
    pub fn is_optimistic(&self, id: PeerId) -> bool {
        self.optimistic_peer == Some(id)
    }

    /// Forget a peer that went away.
    pub fn peer_disconnected(&mut self, id: PeerId) {
        if self.optimistic_peer == Some(id) {
            self.optimistic_peer = None;
        }
    }
}
