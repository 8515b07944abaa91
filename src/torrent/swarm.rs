//! Swarm core
//!
//! Owns the piece table, the peer views and both schedulers, and turns each
//! incoming [`SwarmEvent`] into [`Command`]s for the peer-wire layer, the
//! file service and the tracker. All state is mutated from one place; the
//! engine task feeds events in order.

use std::time::Instant;

use rand::rngs::StdRng;

use super::choking::{ChokingDecision, ChokingManager};
use super::events::{Command, Outbox, SwarmEvent, SwarmNotice};
use super::peer::{PeerConnection, PeerSet};
use super::peer_selection::KnownPeers;
use super::picker::BlockScheduler;
use super::piece::{PieceTable, VerifyOutcome};
use super::resume::ResumeState;
use super::state::{Completion, TransferStateMachine};
use crate::config::SwarmConfig;
use crate::error::{Result, SwarmError};
use crate::types::{BlockRequest, PeerId, SwarmStatus, TorrentLayout, TransferState};

use bitvec::prelude::*;
use bytes::Bytes;

/// Largest block a peer may ask us for
const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

/// Scheduling core for one torrent
pub struct Swarm {
    config: SwarmConfig,
    table: PieceTable,
    peers: PeerSet,
    known: KnownPeers,
    scheduler: BlockScheduler,
    choker: ChokingManager,
    machine: TransferStateMachine,
    rng: StdRng,

    /// A `Reschedule` command is outstanding
    schedule_pending: bool,
    /// A `ConnectPeers` command is outstanding
    connect_pending: bool,
    last_progress: u32,
    downloaded_bytes: u64,
    uploaded_bytes: u64,
}

impl Swarm {
    /// Create an idle swarm
    pub fn new(config: SwarmConfig, layout: TorrentLayout) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            table: PieceTable::new(layout, config.block_size),
            peers: PeerSet::new(),
            known: KnownPeers::new(&config),
            scheduler: BlockScheduler::new(&config),
            choker: ChokingManager::new(&config),
            machine: TransferStateMachine::new(config.endgame_piece_threshold),
            rng: config.rng(2),
            schedule_pending: false,
            connect_pending: false,
            last_progress: 0,
            downloaded_bytes: 0,
            uploaded_bytes: 0,
            config,
        })
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn state(&self) -> TransferState {
        self.machine.state()
    }

    pub fn table(&self) -> &PieceTable {
        &self.table
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn known_peers(&self) -> &KnownPeers {
        &self.known
    }

    pub fn known_peers_mut(&mut self) -> &mut KnownPeers {
        &mut self.known
    }

    /// Load a resume snapshot before starting
    pub fn restore(&mut self, resume: &ResumeState) -> Result<()> {
        if self.state() != TransferState::Idle {
            return Err(SwarmError::invalid_state("restore", self.state()));
        }
        resume.apply_partials(&mut self.table)
    }

    /// Snapshot of the current progress for persisting
    pub fn resume_state(&self) -> ResumeState {
        ResumeState::capture(&self.table)
    }

    /// Status snapshot for display
    pub fn status(&self) -> SwarmStatus {
        SwarmStatus {
            state: self.state(),
            progress: self.table.progress_percent(),
            completed_pieces: self.table.completed_count(),
            piece_count: self.table.piece_count(),
            connected_peers: self.peers.connected().count(),
            seeds: self.peers.connected().filter(|p| p.is_seed()).count(),
            downloaded_bytes: self.downloaded_bytes,
            uploaded_bytes: self.uploaded_bytes,
            peers: self.peers.iter().map(|p| p.info()).collect(),
        }
    }

    fn completion(&self) -> Completion {
        Completion {
            completed: self.table.completed_count(),
            piece_count: self.table.piece_count(),
            incomplete: self.table.incomplete_count(),
            pending: self.table.pending_len(),
        }
    }

    /// Process one event and collect what has to happen next
    pub fn handle(&mut self, event: SwarmEvent, now: Instant) -> Outbox {
        let mut out = Outbox::new();
        if let Err(e) = self.dispatch(event, now, &mut out) {
            tracing::warn!("swarm event rejected: {}", e);
        }
        if out.reschedule {
            out.reschedule = false;
            self.request_schedule(&mut out);
        }
        out
    }

    fn dispatch(&mut self, event: SwarmEvent, now: Instant, out: &mut Outbox) -> Result<()> {
        match event {
            SwarmEvent::Start => self.on_start(out),
            SwarmEvent::Stop => self.on_stop(out),
            SwarmEvent::Pause => self.on_pause(out),
            SwarmEvent::Resume => self.on_resume(out),

            SwarmEvent::VerificationDone { completed } => self.on_verification_done(&completed, out),
            SwarmEvent::PieceVerified { piece, ok } => self.on_piece_verified(piece, ok, out),
            SwarmEvent::BlockRead {
                peer,
                piece,
                offset,
                data,
            } => {
                self.on_block_read(peer, piece, offset, data, out);
                Ok(())
            }
            SwarmEvent::FileError { message } => {
                self.on_file_error(message, out);
                Ok(())
            }

            SwarmEvent::PeersDiscovered(addrs) => {
                let added = self.known.add(&addrs, &self.peers);
                tracing::debug!("tracker returned {} peers, {} new", addrs.len(), added);
                if added > 0 {
                    self.request_connect(out);
                }
                Ok(())
            }
            SwarmEvent::TrackerStopped => {
                self.machine.stopped(out);
                if self.state() == TransferState::Idle {
                    out.notify(SwarmNotice::Stopped);
                }
                Ok(())
            }

            SwarmEvent::PeerConnected {
                peer,
                addr,
                outbound,
            } => {
                self.on_peer_connected(peer, addr, outbound, now, out);
                Ok(())
            }
            SwarmEvent::ConnectFailed { addr, refused } => {
                if refused && self.known.remove(addr) {
                    tracing::debug!("connection to {} refused, forgetting peer", addr);
                }
                self.request_connect(out);
                Ok(())
            }
            SwarmEvent::HandshakeComplete(peer) => {
                let result = self.on_handshake(peer, out);
                self.peer_result(peer, result, out)
            }
            SwarmEvent::PiecesAdvertised { peer, bitfield } => {
                let result = self.on_pieces_advertised(peer, &bitfield, out);
                self.peer_result(peer, result, out)
            }
            SwarmEvent::PieceAnnounced { peer, piece } => {
                let result = self.on_piece_announced(peer, piece, out);
                self.peer_result(peer, result, out)
            }
            SwarmEvent::BlockRequested { peer, request } => {
                self.on_block_requested(peer, request, out);
                Ok(())
            }
            SwarmEvent::BlockReceived {
                peer,
                piece,
                offset,
                data,
            } => {
                let result = self.on_block_received(peer, piece, offset, data, out);
                self.peer_result(peer, result, out)
            }
            SwarmEvent::Choked(peer) => {
                let result = self.on_choked(peer);
                if result.is_ok() {
                    out.want_reschedule();
                }
                self.peer_result(peer, result, out)
            }
            SwarmEvent::Unchoked(peer) => {
                let result = self.on_unchoked(peer, out);
                self.peer_result(peer, result, out)
            }
            SwarmEvent::Interested(peer) => {
                let result = self.peers.require_mut(peer).map(|p| p.peer_interested = true);
                self.peer_result(peer, result, out)
            }
            SwarmEvent::NotInterested(peer) => {
                let result = self.peers.require_mut(peer).map(|p| p.peer_interested = false);
                self.peer_result(peer, result, out)
            }
            SwarmEvent::RatesUpdated {
                peer,
                upload_rate,
                download_rate,
            } => {
                let result = self.peers.require_mut(peer).map(|p| {
                    p.upload_rate = upload_rate;
                    p.download_rate = download_rate;
                });
                self.peer_result(peer, result, out)
            }
            SwarmEvent::Disconnected(peer) => {
                if self.peers.contains(peer) {
                    tracing::debug!("{} disconnected", peer);
                    self.remove_peer(peer, out);
                }
                Ok(())
            }

            SwarmEvent::ScheduleTick => {
                self.schedule_pending = false;
                self.on_schedule_tick(out);
                Ok(())
            }
            SwarmEvent::ConnectTick => {
                self.connect_pending = false;
                self.on_connect_tick(now, out);
                Ok(())
            }
            SwarmEvent::ChokeTick => {
                self.on_choke_tick(out);
                Ok(())
            }
        }
    }

    /// Drop the connection on protocol faults; other per-peer errors only
    /// mean the event was stale
    fn peer_result(&mut self, peer: PeerId, result: Result<()>, out: &mut Outbox) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal_to_connection() => {
                tracing::warn!("dropping {}: {}", peer, e);
                self.drop_peer(peer, out);
                Ok(())
            }
            Err(SwarmError::UnknownPeer(id)) => {
                tracing::trace!("event for unknown connection {}", id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // Debounced triggers

    fn request_schedule(&mut self, out: &mut Outbox) {
        if !self.schedule_pending {
            self.schedule_pending = true;
            out.push(Command::Reschedule);
        }
    }

    fn request_connect(&mut self, out: &mut Outbox) {
        if !self.connect_pending && self.accepts_peers() {
            self.connect_pending = true;
            out.push(Command::ConnectPeers);
        }
    }

    /// Whether connections may be opened or accepted in the current phase
    fn accepts_peers(&self) -> bool {
        self.state().is_active()
    }

    fn update_progress(&mut self, out: &mut Outbox) {
        let progress = self.table.progress_percent();
        if progress != self.last_progress {
            self.last_progress = progress;
            out.notify(SwarmNotice::Progress(progress));
        }
    }

    // Session control

    fn on_start(&mut self, out: &mut Outbox) -> Result<()> {
        self.machine.start(out)?;
        tracing::info!(
            "starting transfer of {} pieces",
            self.table.piece_count()
        );
        out.push(Command::StartVerification);
        Ok(())
    }

    fn on_verification_done(
        &mut self,
        completed: &BitSlice<u8, Msb0>,
        out: &mut Outbox,
    ) -> Result<()> {
        self.table.set_completed_pieces(completed)?;
        self.machine.verification_done(self.completion(), out)?;
        tracing::info!(
            "verification done: {}/{} pieces present",
            self.table.completed_count(),
            self.table.piece_count()
        );
        if self.state() == TransferState::Seeding {
            out.push(Command::TrackerStartSeeding);
        } else {
            out.push(Command::TrackerStart);
        }
        self.update_progress(out);
        if !self.known.is_empty() {
            self.request_connect(out);
        }
        Ok(())
    }

    fn on_stop(&mut self, out: &mut Outbox) -> Result<()> {
        let tracker_started = self.machine.stop(out)?;
        self.disconnect_all(out);
        if tracker_started {
            out.push(Command::TrackerStop);
        } else {
            out.notify(SwarmNotice::Stopped);
        }
        Ok(())
    }

    fn on_pause(&mut self, out: &mut Outbox) -> Result<()> {
        self.machine.pause(out)?;
        self.disconnect_all(out);
        Ok(())
    }

    fn on_resume(&mut self, out: &mut Outbox) -> Result<()> {
        self.machine.resume(self.completion(), out)?;
        self.request_connect(out);
        Ok(())
    }

    fn on_file_error(&mut self, message: String, out: &mut Outbox) {
        tracing::error!("file error: {}", message);
        if self.state() == TransferState::Paused {
            return;
        }
        if self.state().is_active() && self.machine.pause(out).is_ok() {
            self.disconnect_all(out);
        }
        out.notify(SwarmNotice::FileError(message));
    }

    fn disconnect_all(&mut self, out: &mut Outbox) {
        for id in self.peers.ids() {
            self.drop_peer(id, out);
        }
    }

    // Connections

    fn on_peer_connected(
        &mut self,
        id: PeerId,
        addr: std::net::SocketAddr,
        outbound: bool,
        now: Instant,
        out: &mut Outbox,
    ) {
        if !self.accepts_peers() {
            tracing::debug!("rejecting {} from {} while {}", id, addr, self.state());
            out.push(Command::Disconnect(id));
            return;
        }
        if !outbound && self.peers.len() >= self.config.max_connections {
            tracing::debug!("connection limit reached, rejecting {}", addr);
            out.push(Command::Disconnect(id));
            return;
        }
        if outbound {
            self.known.mark_connected(addr, now);
        }
        self.peers
            .insert(PeerConnection::new(id, addr, self.table.piece_count()));
        out.push(Command::SendBitfield {
            peer: id,
            bitfield: self.table.completed_pieces().to_bitvec(),
        });
        out.notify(SwarmNotice::PeerInfoUpdated);
    }

    fn on_handshake(&mut self, id: PeerId, out: &mut Outbox) -> Result<()> {
        self.peers.require_mut(id)?.mark_connected();
        tracing::debug!("handshake complete with {}", id);
        self.machine.handshake_complete(self.completion(), out);
        out.notify(SwarmNotice::PeerInfoUpdated);
        Ok(())
    }

    /// Drop a connection we decided to close
    fn drop_peer(&mut self, id: PeerId, out: &mut Outbox) {
        if self.peers.contains(id) {
            out.push(Command::Disconnect(id));
            self.remove_peer(id, out);
        }
    }

    /// Forget a connection and give its claims back
    fn remove_peer(&mut self, id: PeerId, out: &mut Outbox) {
        self.scheduler.release_peer(&mut self.table, &mut self.peers, id);
        self.peers.remove(id);
        self.choker.peer_disconnected(id);
        out.notify(SwarmNotice::PeerInfoUpdated);
        if self.accepts_peers() {
            out.want_reschedule();
            self.request_connect(out);
        }
    }

    fn on_connect_tick(&mut self, now: Instant, out: &mut Outbox) {
        if !self.accepts_peers() {
            return;
        }
        let picked = self.known.pick_connections(
            &self.peers,
            self.state(),
            self.table.piece_count(),
            now,
            &mut self.rng,
        );
        if picked.is_empty() {
            return;
        }
        self.machine.connecting(out);
        for addr in picked {
            out.push(Command::Connect(addr));
        }
    }

    // Piece availability and interest

    fn on_pieces_advertised(
        &mut self,
        id: PeerId,
        bitfield: &BitSlice<u8, Msb0>,
        out: &mut Outbox,
    ) -> Result<()> {
        let peer = self.peers.require_mut(id)?;
        peer.set_bitfield(bitfield)?;
        let (addr, pieces, seed) = (peer.addr(), peer.pieces_available(), peer.is_seed());
        self.known.update_pieces(addr, pieces, seed);
        self.update_interest(id, out);
        Ok(())
    }

    fn on_piece_announced(&mut self, id: PeerId, piece: u32, out: &mut Outbox) -> Result<()> {
        let peer = self.peers.require_mut(id)?;
        peer.announce_piece(piece)?;
        let (addr, pieces, seed) = (peer.addr(), peer.pieces_available(), peer.is_seed());
        self.known.update_pieces(addr, pieces, seed);
        if !self.table.have_piece(piece) || seed {
            self.update_interest(id, out);
        }
        Ok(())
    }

    /// Sync our interest flag with what the peer can offer.
    ///
    /// Seeds are pointless to keep while we are seeding ourselves.
    fn update_interest(&mut self, id: PeerId, out: &mut Outbox) {
        let seeding = self.state() == TransferState::Seeding;
        let Some(peer) = self.peers.get_mut(id) else {
            return;
        };
        if peer.is_seed() && seeding {
            tracing::debug!("{} is a seed and so are we, disconnecting", id);
            self.drop_peer(id, out);
            return;
        }

        let interesting = peer.has_any_of(self.table.incomplete_pieces());
        if interesting != peer.am_interested {
            peer.am_interested = interesting;
            out.push(if interesting {
                Command::SendInterested(id)
            } else {
                Command::SendNotInterested(id)
            });
        }
        if interesting && !peer.peer_choking && peer.in_flight_count() == 0 {
            out.want_reschedule();
        }
    }

    fn on_choked(&mut self, id: PeerId) -> Result<()> {
        self.peers.require_mut(id)?.peer_choking = true;
        self.scheduler.release_peer(&mut self.table, &mut self.peers, id);
        Ok(())
    }

    fn on_unchoked(&mut self, id: PeerId, out: &mut Outbox) -> Result<()> {
        let peer = self.peers.require_mut(id)?;
        peer.peer_choking = false;
        if peer.am_interested {
            out.want_reschedule();
        }
        Ok(())
    }

    // Download side

    fn on_schedule_tick(&mut self, out: &mut Outbox) {
        let state = self.state();
        if !state.is_active() || state == TransferState::Seeding {
            return;
        }
        let issued = self
            .scheduler
            .schedule_all(&mut self.table, &mut self.peers, state, out);
        if issued > 0 {
            tracing::trace!("scheduling pass issued {} requests", issued);
        }
        self.machine.check_endgame(self.completion(), out);
    }

    fn on_block_received(
        &mut self,
        id: PeerId,
        piece: u32,
        offset: u32,
        data: Bytes,
        out: &mut Outbox,
    ) -> Result<()> {
        let len = data.len() as u64;
        self.scheduler.on_block_received(
            &mut self.table,
            &mut self.peers,
            self.machine.state(),
            id,
            piece,
            offset,
            data,
            out,
        )?;
        self.downloaded_bytes += len;
        self.machine.block_received(self.completion(), out);
        Ok(())
    }

    fn on_piece_verified(&mut self, index: u32, ok: bool, out: &mut Outbox) -> Result<()> {
        match self.table.on_verified(index, ok)? {
            VerifyOutcome::Verified { .. } => {
                tracing::debug!("piece {} verified", index);
                self.scheduler.detach_piece(&mut self.peers, index);
                for peer in self.peers.connected() {
                    if !peer.has_piece(index) {
                        out.push(Command::SendHave {
                            peer: peer.id(),
                            piece: index,
                        });
                    }
                }
                if self.machine.piece_verified(self.completion(), out) {
                    tracing::info!("all pieces complete, seeding");
                    out.push(Command::TrackerStartSeeding);
                }
                for id in self.peers.ids() {
                    self.update_interest(id, out);
                }
                self.update_progress(out);
                out.want_reschedule();
            }
            VerifyOutcome::Failed { .. } => {
                self.scheduler.detach_piece(&mut self.peers, index);
                out.want_reschedule();
            }
            VerifyOutcome::Ignored => {
                tracing::debug!("ignoring verification result for piece {}", index);
            }
        }
        Ok(())
    }

    // Upload side

    fn on_block_requested(&mut self, id: PeerId, request: BlockRequest, out: &mut Outbox) {
        let Some(peer) = self.peers.get(id) else {
            return;
        };
        if peer.am_choking || !self.table.have_piece(request.piece) {
            tracing::trace!("ignoring request from {} for piece {}", id, request.piece);
            return;
        }
        let in_bounds = self
            .table
            .layout()
            .piece_length_at(request.piece)
            .map(|len| {
                request.length > 0
                    && request.length <= MAX_REQUEST_LENGTH
                    && request.offset.checked_add(request.length).is_some_and(|end| end <= len)
            })
            .unwrap_or(false);
        if !in_bounds {
            tracing::debug!("{} requested an invalid range {:?}", id, request);
            return;
        }
        out.push(Command::ReadBlock { peer: id, request });
    }

    fn on_block_read(&mut self, id: PeerId, piece: u32, offset: u32, data: Bytes, out: &mut Outbox) {
        let Some(peer) = self.peers.get(id) else {
            return;
        };
        if !peer.is_connected() || peer.am_choking {
            return;
        }
        self.uploaded_bytes += data.len() as u64;
        out.push(Command::SendBlock {
            peer: id,
            piece,
            offset,
            data,
        });
    }

    fn on_choke_tick(&mut self, out: &mut Outbox) {
        let state = self.state();
        if !state.is_active() {
            return;
        }
        let stats: Vec<_> = self.peers.connected().map(|p| p.stats()).collect();
        let decisions = self
            .choker
            .rebalance(&stats, state == TransferState::Seeding);
        for decision in decisions {
            match decision {
                ChokingDecision::Unchoke(id) => {
                    if let Some(peer) = self.peers.get_mut(id) {
                        peer.am_choking = false;
                        out.push(Command::UnchokePeer(id));
                    }
                }
                ChokingDecision::Choke(id) => {
                    if let Some(peer) = self.peers.get_mut(id) {
                        peer.am_choking = true;
                        out.push(Command::ChokePeer(id));
                    }
                }
                ChokingDecision::Disconnect(id) => self.drop_peer(id, out),
            }
        }
    }
}
