//! Known peers and connection candidate selection
//!
//! Addresses handed out by the tracker are remembered here together with
//! what we learned about them on earlier visits. When the connector runs,
//! free peers are scored, grouped into buckets and drawn from a weighted
//! pool, so peers that looked useful and connected quickly are dialed first
//! without starving the rest.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::Rng;

use super::peer::PeerSet;
use crate::config::SwarmConfig;
use crate::types::TransferState;

/// Combined rate above which a connection counts as active when trimming
const ACTIVE_RATE: u64 = 1024;

/// What we know about a peer address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownPeer {
    pub addr: SocketAddr,
    /// Worth connecting to at all
    pub interesting: bool,
    /// Advertised every piece last time we saw it
    pub seed: bool,
    /// Pieces advertised last time we saw it
    pub pieces_completed: u32,
    /// Last dial attempt
    pub last_visited: Option<Instant>,
    /// When the last dial started; `None` for a peer never dialed
    pub connect_start: Option<Instant>,
    /// How long the last successful dial took
    pub connect_time: Option<Duration>,
}

impl KnownPeer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            interesting: true,
            seed: false,
            pieces_completed: 0,
            last_visited: None,
            connect_start: None,
            connect_time: None,
        }
    }

    /// Connection score used for weighting
    pub fn score(&self, piece_count: u32, seeding: bool, fast_connect_secs: u64) -> u64 {
        if !self.interesting {
            return 0;
        }
        let piece_count = piece_count as u64;
        let pieces = (self.pieces_completed as u64).min(piece_count);
        let mut score = if seeding { piece_count - pieces } else { pieces };
        if self.connect_start.is_none() {
            // Nothing known yet: assume it is as good as a seed.
            score += piece_count;
        }
        if let Some(took) = self.connect_time {
            let secs = took.as_secs();
            if secs < fast_connect_secs {
                score += (piece_count / 10) * (fast_connect_secs - secs);
            }
        }
        score
    }
}

/// The known-peer list of one transfer
#[derive(Debug)]
pub struct KnownPeers {
    peers: Vec<KnownPeer>,
    listen_addr: Option<SocketAddr>,
    max_known: usize,
    max_connections: usize,
    max_per_peer: usize,
    min_revisit: Duration,
    fast_connect_secs: u64,
}

impl KnownPeers {
    pub fn new(config: &SwarmConfig) -> Self {
        Self {
            peers: Vec::new(),
            listen_addr: None,
            max_known: config.max_known_peers(),
            max_connections: config.max_connections,
            max_per_peer: config.max_connections_per_peer,
            min_revisit: config.min_revisit(),
            fast_connect_secs: config.fast_connect_secs,
        }
    }

    /// Our own listening address; never added as a peer
    pub fn set_listen_addr(&mut self, addr: SocketAddr) {
        self.listen_addr = Some(addr);
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KnownPeer> {
        self.peers.iter()
    }

    pub fn get(&self, addr: SocketAddr) -> Option<&KnownPeer> {
        self.peers.iter().find(|p| p.addr == addr)
    }

    pub fn get_mut(&mut self, addr: SocketAddr) -> Option<&mut KnownPeer> {
        self.peers.iter_mut().find(|p| p.addr == addr)
    }

    /// Add tracker results, skipping duplicates and our own address.
    ///
    /// If the list grows past its cap, peers without an active connection
    /// are dropped first, then the oldest entries. Returns how many
    /// addresses were new.
    pub fn add(&mut self, addrs: &[SocketAddr], connections: &PeerSet) -> usize {
        let mut added = 0;
        for &addr in addrs {
            if Some(addr) == self.listen_addr || self.get(addr).is_some() {
                continue;
            }
            self.peers.push(KnownPeer::new(addr));
            added += 1;
        }

        if self.peers.len() > self.max_known {
            let mut too_many = self.peers.len() - self.max_known;
            self.peers.retain(|known| {
                if too_many == 0 {
                    return true;
                }
                let active = connections.iter().any(|c| {
                    c.addr() == known.addr
                        && c.download_rate.saturating_add(c.upload_rate) > ACTIVE_RATE
                });
                if active {
                    return true;
                }
                too_many -= 1;
                false
            });
            // Still too many: drop the oldest.
            self.peers.drain(..too_many);
            tracing::debug!(known = self.peers.len(), "trimmed known peer list");
        }
        added
    }

    /// Forget a peer, e.g. after the connection was refused
    pub fn remove(&mut self, addr: SocketAddr) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.addr != addr);
        self.peers.len() != before
    }

    /// Record a finished dial and how long it took
    pub fn mark_connected(&mut self, addr: SocketAddr, now: Instant) {
        if let Some(peer) = self.get_mut(addr) {
            peer.last_visited = Some(now);
            if let Some(start) = peer.connect_start {
                peer.connect_time = Some(now.saturating_duration_since(start));
            }
        }
    }

    /// Remember what a connected peer advertised
    pub fn update_pieces(&mut self, addr: SocketAddr, pieces_completed: u32, seed: bool) {
        if let Some(peer) = self.get_mut(addr) {
            peer.pieces_completed = pieces_completed;
            peer.seed = seed;
        }
    }

    /// Peers not at their connection cap and not visited recently
    pub fn free_peers(&self, connections: &PeerSet, now: Instant) -> Vec<&KnownPeer> {
        self.peers
            .iter()
            .filter(|p| connections.connections_to(p.addr) < self.max_per_peer)
            .filter(|p| match p.last_visited {
                Some(visited) => now.saturating_duration_since(visited) > self.min_revisit,
                None => true,
            })
            .collect()
    }

    /// Weighted candidate pool.
    ///
    /// Peers are sorted by score and split into buckets wherever two
    /// neighbouring scores differ by more than one; a peer in bucket `k`
    /// appears `k + 1` times.
    pub fn weighted_pool(
        &self,
        connections: &PeerSet,
        state: TransferState,
        piece_count: u32,
        now: Instant,
    ) -> Vec<SocketAddr> {
        let seeding = state == TransferState::Seeding;
        let mut scored: Vec<(u64, SocketAddr)> = self
            .free_peers(connections, now)
            .into_iter()
            .map(|p| (p.score(piece_count, seeding, self.fast_connect_secs), p.addr))
            .collect();
        scored.sort();

        let mut pool = Vec::new();
        let mut bucket = 0usize;
        let mut previous: Option<u64> = None;
        for (score, addr) in scored {
            if let Some(prev) = previous {
                if score > prev + 1 {
                    bucket += 1;
                }
            }
            previous = Some(score);
            pool.extend(std::iter::repeat(addr).take(bucket + 1));
        }
        pool
    }

    /// Choose addresses to dial now and mark them visited.
    ///
    /// Draws uniformly from the weighted pool until the connection budget is
    /// used up or nobody is left.
    pub fn pick_connections(
        &mut self,
        connections: &PeerSet,
        state: TransferState,
        piece_count: u32,
        now: Instant,
        rng: &mut StdRng,
    ) -> Vec<SocketAddr> {
        let mut pool = self.weighted_pool(connections, state, piece_count, now);
        let mut budget = self.max_connections.saturating_sub(connections.len());
        let mut picked = Vec::new();

        while budget > 0 && !pool.is_empty() {
            let addr = pool[rng.random_range(0..pool.len())];
            pool.retain(|&a| a != addr);
            if let Some(peer) = self.get_mut(addr) {
                peer.connect_start = Some(now);
                peer.last_visited = Some(now);
            }
            picked.push(addr);
            budget -= 1;
        }
        if !picked.is_empty() {
            tracing::debug!(count = picked.len(), "dialing peers");
        }
        picked
    }
}
