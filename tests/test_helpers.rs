//! Test Helpers
//!
//! Drives a [`Swarm`] synchronously against scripted peers, a scripted file
//! service and a scripted tracker. Every command the core emits is logged and
//! answered the way the real collaborator would answer it, by queueing the
//! matching event.

#![allow(dead_code)]


use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitvec::prelude::*;
use bytes::Bytes;
use parking_lot::Mutex;

use gosh_swarm::{
    BlockRequest, Command, FileService, PeerId, PeerWire, Swarm, SwarmConfig, SwarmEvent,
    SwarmHandle, SwarmNotice, SwarmServices, TorrentLayout, TrackerClient, TransferState,
};

use mock_peer::{MockPeer, MockPeerConfig};

/// Default block size used by the helpers
pub const BS: u32 = 16384;

/// Upper bound on events processed by one `run` call
const MAX_STEPS: usize = 200_000;

/// Layout with `pieces` pieces of `blocks_per_piece` full blocks each
pub fn layout(pieces: u32, blocks_per_piece: u32) -> TorrentLayout {
    let piece_length = blocks_per_piece * BS;
    TorrentLayout::new(pieces as u64 * piece_length as u64, piece_length)
        .expect("valid test layout")
}

/// Configuration with a fixed random seed so runs are reproducible
pub fn test_config(seed: u64) -> SwarmConfig {
    SwarmConfig {
        rng_seed: Some(seed),
        ..SwarmConfig::default()
    }
}

/// Payload for a block; the contents do not matter to the core
pub fn block_data(length: u32) -> Bytes {
    Bytes::from(vec![0xAB; length as usize])
}

// =============================================================================
// Synchronous simulation
// =============================================================================

/// Builder for a [`Simulation`]
pub struct SimulationBuilder {
    config: SwarmConfig,
    layout: TorrentLayout,
    peers: Vec<MockPeerConfig>,
    verify_failures: HashMap<u32, usize>,
    have: Option<BitVec<u8, Msb0>>,
}

impl SimulationBuilder {
    pub fn new(pieces: u32, blocks_per_piece: u32) -> Self {
        Self {
            config: test_config(7),
            layout: layout(pieces, blocks_per_piece),
            peers: Vec::new(),
            verify_failures: HashMap::new(),
            have: None,
        }
    }

    pub fn config(mut self, config: SwarmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.rng_seed = Some(seed);
        self
    }

    /// Add a remote peer reachable through the tracker
    pub fn peer(mut self, config: MockPeerConfig) -> Self {
        self.peers.push(config);
        self
    }

    /// Make the first `times` verifications of `piece` fail
    pub fn fail_verification(mut self, piece: u32, times: usize) -> Self {
        self.verify_failures.insert(piece, times);
        self
    }

    /// Pieces already on disk when verification runs
    pub fn have(mut self, have: BitVec<u8, Msb0>) -> Self {
        self.have = Some(have);
        self
    }

    pub fn build(self) -> Simulation {
        let piece_count = self.layout.piece_count() as usize;
        let swarm = Swarm::new(self.config, self.layout).expect("valid test swarm");
        let peers = self
            .peers
            .into_iter()
            .enumerate()
            .map(|(i, config)| {
                let peer = MockPeer::new(6881 + i as u16, config);
                (peer.addr, peer)
            })
            .collect();
        Simulation {
            swarm,
            now: Instant::now(),
            queue: VecDeque::new(),
            peers,
            connections: HashMap::new(),
            next_id: 1,
            verify_failures: self.verify_failures,
            have: self.have.unwrap_or_else(|| bitvec![u8, Msb0; 0; piece_count]),
            commands: Vec::new(),
            notices: Vec::new(),
        }
    }
}

/// A swarm plus everything it talks to, stepped one event at a time
pub struct Simulation {
    pub swarm: Swarm,
    pub now: Instant,
    queue: VecDeque<SwarmEvent>,
    peers: HashMap<SocketAddr, MockPeer>,
    connections: HashMap<PeerId, SocketAddr>,
    next_id: u64,
    verify_failures: HashMap<u32, usize>,
    have: BitVec<u8, Msb0>,
    /// Every command the core emitted, in order
    pub commands: Vec<Command>,
    /// Every notice the core emitted, in order
    pub notices: Vec<SwarmNotice>,
}

impl Simulation {
    /// Queue an event behind everything already waiting
    pub fn post(&mut self, event: SwarmEvent) {
        self.queue.push_back(event);
    }

    /// Process queued events until nothing is left
    pub fn run(&mut self) -> usize {
        self.run_with(|_| {})
    }

    /// Like [`Simulation::run`], calling `check` after every event
    pub fn run_with(&mut self, mut check: impl FnMut(&Simulation)) -> usize {
        let mut steps = 0;
        while let Some(event) = self.queue.pop_front() {
            self.step(event);
            check(self);
            steps += 1;
            assert!(steps < MAX_STEPS, "simulation did not settle");
        }
        steps
    }

    /// Process at most `n` queued events
    pub fn run_steps(&mut self, n: usize) {
        for _ in 0..n {
            let Some(event) = self.queue.pop_front() else {
                return;
            };
            self.step(event);
        }
    }

    /// Handle `event` right away, ahead of the queue
    pub fn interrupt(&mut self, event: SwarmEvent) {
        self.step(event);
    }

    /// Start the session and run until idle
    pub fn start(&mut self) {
        self.post(SwarmEvent::Start);
        self.run();
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn state(&self) -> TransferState {
        self.swarm.state()
    }

    /// Peer id assigned to a mock peer's current connection
    pub fn peer_id(&self, addr: SocketAddr) -> Option<PeerId> {
        self.connections
            .iter()
            .find(|(_, a)| **a == addr)
            .map(|(id, _)| *id)
    }

    pub fn mock_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<_> = self.peers.keys().copied().collect();
        addrs.sort();
        addrs
    }

    /// How often the core asked for `piece` to be verified
    pub fn verify_count(&self, piece: u32) -> usize {
        self.commands
            .iter()
            .filter(|c| **c == Command::VerifyPiece(piece))
            .count()
    }

    pub fn count_commands(&self, pred: impl Fn(&Command) -> bool) -> usize {
        self.commands.iter().filter(|c| pred(c)).count()
    }

    /// Transitions seen so far, as `(old, new)` pairs
    pub fn transitions(&self) -> Vec<(TransferState, TransferState)> {
        self.notices
            .iter()
            .filter_map(|n| match n {
                SwarmNotice::StateChanged {
                    old_state,
                    new_state,
                } => Some((*old_state, *new_state)),
                _ => None,
            })
            .collect()
    }

    /// Every requested block must be missing and in flight at some peer
    pub fn assert_requests_consistent(&self) {
        let table = self.swarm.table();
        for piece in table.pending() {
            for block in piece.requested_blocks().iter_ones() {
                assert!(
                    !piece.completed_blocks()[block],
                    "block {} of piece {} is both complete and requested",
                    block, piece.index
                );
                let offset = piece.block_request(block as u32).offset;
                let owned = self
                    .swarm
                    .peers()
                    .iter()
                    .any(|p| p.is_requested_at(piece.index, offset));
                assert!(
                    owned,
                    "block {} of piece {} is marked requested but nobody fetches it",
                    block, piece.index
                );
            }
        }
    }

    fn step(&mut self, event: SwarmEvent) {
        let out = self.swarm.handle(event, self.now);
        self.notices.extend(out.notices);
        for command in out.commands {
            self.respond(&command);
            self.commands.push(command);
        }
    }

    fn respond(&mut self, command: &Command) {
        match command {
            Command::Reschedule => self.post(SwarmEvent::ScheduleTick),
            Command::ConnectPeers => self.post(SwarmEvent::ConnectTick),

            Command::StartVerification => self.post(SwarmEvent::VerificationDone {
                completed: self.have.clone(),
            }),
            Command::VerifyPiece(piece) => {
                let ok = match self.verify_failures.get_mut(piece) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        false
                    }
                    _ => true,
                };
                self.post(SwarmEvent::PieceVerified { piece: *piece, ok });
            }

            Command::TrackerStart => {
                let addrs = self.mock_addrs();
                self.post(SwarmEvent::PeersDiscovered(addrs));
            }
            Command::TrackerStop => self.post(SwarmEvent::TrackerStopped),

            Command::Connect(addr) => self.dial(*addr),
            Command::Disconnect(peer) => self.hang_up(*peer, false),
            Command::RequestBlock { peer, request } => self.serve(*peer, *request),
            Command::CancelRequest { peer, request } => {
                let (peer, request) = (*peer, *request);
                self.queue.retain(|e| {
                    !matches!(e, SwarmEvent::BlockReceived { peer: p, piece, offset, .. }
                        if *p == peer && *piece == request.piece && *offset == request.offset)
                });
            }
            _ => {}
        }
    }

    fn dial(&mut self, addr: SocketAddr) {
        let Some(mock) = self.peers.get_mut(&addr) else {
            self.post(SwarmEvent::ConnectFailed {
                addr,
                refused: true,
            });
            return;
        };
        if mock.config.refuse {
            self.post(SwarmEvent::ConnectFailed {
                addr,
                refused: true,
            });
            return;
        }

        mock.connected = true;
        let config = mock.config.clone();
        let peer = PeerId(self.next_id);
        self.next_id += 1;
        self.connections.insert(peer, addr);

        self.post(SwarmEvent::PeerConnected {
            peer,
            addr,
            outbound: true,
        });
        self.post(SwarmEvent::HandshakeComplete(peer));
        self.post(SwarmEvent::PiecesAdvertised {
            peer,
            bitfield: config.pieces.clone(),
        });
        if config.upload_rate > 0 || config.download_rate > 0 {
            self.post(SwarmEvent::RatesUpdated {
                peer,
                upload_rate: config.upload_rate,
                download_rate: config.download_rate,
            });
        }
        if config.auto_unchoke {
            self.post(SwarmEvent::Unchoked(peer));
        }
    }

    /// Close a connection; `remote` when the mock side hangs up
    fn hang_up(&mut self, peer: PeerId, remote: bool) {
        let Some(addr) = self.connections.remove(&peer) else {
            return;
        };
        if let Some(mock) = self.peers.get_mut(&addr) {
            mock.connected = false;
        }
        self.queue.retain(|e| !is_from(e, peer));
        if remote {
            self.post(SwarmEvent::Disconnected(peer));
        }
    }

    fn serve(&mut self, peer: PeerId, request: BlockRequest) {
        let Some(addr) = self.connections.get(&peer).copied() else {
            return;
        };
        let Some(mock) = self.peers.get_mut(&addr) else {
            return;
        };
        if !mock.config.pieces[request.piece as usize] {
            return;
        }
        let keep_open = mock.serve_block();
        self.post(SwarmEvent::BlockReceived {
            peer,
            piece: request.piece,
            offset: request.offset,
            data: block_data(request.length),
        });
        if !keep_open {
            self.connections.remove(&peer);
            if let Some(mock) = self.peers.get_mut(&addr) {
                mock.connected = false;
            }
            self.post(SwarmEvent::Disconnected(peer));
        }
    }
}

/// Whether a queued event originates from `peer`
fn is_from(event: &SwarmEvent, peer: PeerId) -> bool {
    match event {
        SwarmEvent::HandshakeComplete(p)
        | SwarmEvent::Choked(p)
        | SwarmEvent::Unchoked(p)
        | SwarmEvent::Interested(p)
        | SwarmEvent::NotInterested(p)
        | SwarmEvent::Disconnected(p) => *p == peer,
        SwarmEvent::PeerConnected { peer: p, .. }
        | SwarmEvent::PiecesAdvertised { peer: p, .. }
        | SwarmEvent::PieceAnnounced { peer: p, .. }
        | SwarmEvent::BlockRequested { peer: p, .. }
        | SwarmEvent::BlockReceived { peer: p, .. }
        | SwarmEvent::RatesUpdated { peer: p, .. } => *p == peer,
        _ => false,
    }
}

// =============================================================================
// Fake collaborators for the async engine
// =============================================================================

/// A call made to one of the fake collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartVerification,
    WriteBlock { piece: u32, offset: u32 },
    VerifyPiece(u32),
    ReadBlock(PeerId, BlockRequest),
    Connect(SocketAddr),
    Disconnect(PeerId),
    Interested(PeerId, bool),
    Bitfield(PeerId),
    Have(PeerId, u32),
    Request(PeerId, BlockRequest),
    Cancel(PeerId, BlockRequest),
    SendBlock(PeerId, u32, u32),
    Choke(PeerId, bool),
    TrackerStart,
    TrackerStartSeeding,
    TrackerStop,
}

/// Collaborators that record calls and, once wired to a handle, answer them
/// like a cooperative disk, tracker and swarm of seeds would.
#[derive(Default)]
pub struct FakeServices {
    calls: Mutex<Vec<Call>>,
    handle: Mutex<Option<SwarmHandle>>,
    seeds: Vec<SocketAddr>,
    piece_count: usize,
    next_peer: AtomicU64,
}

impl FakeServices {
    /// Record only
    pub fn recording() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer calls; `seeds` have all `piece_count` pieces
    pub fn responding(seeds: Vec<SocketAddr>, piece_count: usize) -> Arc<Self> {
        Arc::new(Self {
            seeds,
            piece_count,
            next_peer: AtomicU64::new(1),
            ..Self::default()
        })
    }

    pub fn services(self: &Arc<Self>) -> SwarmServices {
        SwarmServices {
            files: self.clone(),
            wire: self.clone(),
            tracker: self.clone(),
        }
    }

    /// Start answering calls through `handle`
    pub fn attach(&self, handle: SwarmHandle) {
        *self.handle.lock() = Some(handle);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn has_call(&self, call: &Call) -> bool {
        self.calls.lock().contains(call)
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn reply(&self, event: SwarmEvent) {
        if let Some(handle) = self.handle.lock().as_ref() {
            let _ = handle.post(event);
        }
    }
}

impl FileService for FakeServices {
    fn start_verification(&self) {
        self.record(Call::StartVerification);
        self.reply(SwarmEvent::VerificationDone {
            completed: bitvec![u8, Msb0; 0; self.piece_count],
        });
    }

    fn write_block(&self, piece: u32, offset: u32, _data: Bytes) {
        self.record(Call::WriteBlock { piece, offset });
    }

    fn verify_piece(&self, piece: u32) {
        self.record(Call::VerifyPiece(piece));
        self.reply(SwarmEvent::PieceVerified { piece, ok: true });
    }

    fn read_block(&self, peer: PeerId, request: BlockRequest) {
        self.record(Call::ReadBlock(peer, request));
        self.reply(SwarmEvent::BlockRead {
            peer,
            piece: request.piece,
            offset: request.offset,
            data: block_data(request.length),
        });
    }
}

impl PeerWire for FakeServices {
    fn connect(&self, addr: SocketAddr) {
        self.record(Call::Connect(addr));
        if !self.seeds.contains(&addr) {
            self.reply(SwarmEvent::ConnectFailed {
                addr,
                refused: true,
            });
            return;
        }
        let peer = PeerId(self.next_peer.fetch_add(1, Ordering::Relaxed));
        self.reply(SwarmEvent::PeerConnected {
            peer,
            addr,
            outbound: true,
        });
        self.reply(SwarmEvent::HandshakeComplete(peer));
        self.reply(SwarmEvent::PiecesAdvertised {
            peer,
            bitfield: bitvec![u8, Msb0; 1; self.piece_count],
        });
        self.reply(SwarmEvent::Unchoked(peer));
    }

    fn disconnect(&self, peer: PeerId) {
        self.record(Call::Disconnect(peer));
    }

    fn send_interested(&self, peer: PeerId, interested: bool) {
        self.record(Call::Interested(peer, interested));
    }

    fn send_bitfield(&self, peer: PeerId, _bitfield: &BitSlice<u8, Msb0>) {
        self.record(Call::Bitfield(peer));
    }

    fn send_have(&self, peer: PeerId, piece: u32) {
        self.record(Call::Have(peer, piece));
    }

    fn request_block(&self, peer: PeerId, request: BlockRequest) {
        self.record(Call::Request(peer, request));
        self.reply(SwarmEvent::BlockReceived {
            peer,
            piece: request.piece,
            offset: request.offset,
            data: block_data(request.length),
        });
    }

    fn cancel_request(&self, peer: PeerId, request: BlockRequest) {
        self.record(Call::Cancel(peer, request));
    }

    fn send_block(&self, peer: PeerId, piece: u32, offset: u32, _data: Bytes) {
        self.record(Call::SendBlock(peer, piece, offset));
    }

    fn set_choked(&self, peer: PeerId, choked: bool) {
        self.record(Call::Choke(peer, choked));
    }
}

impl TrackerClient for FakeServices {
    fn start(&self) {
        self.record(Call::TrackerStart);
        if !self.seeds.is_empty() {
            self.reply(SwarmEvent::PeersDiscovered(self.seeds.clone()));
        }
    }

    fn start_seeding(&self) {
        self.record(Call::TrackerStartSeeding);
    }

    fn stop(&self) {
        self.record(Call::TrackerStop);
        self.reply(SwarmEvent::TrackerStopped);
    }
}
