//! Swarm Engine - task that drives the scheduling core
//!
//! The [`SwarmEngine`] owns a [`Swarm`] and runs it on a single tokio task.
//! Everything that touches piece or peer state arrives on one unbounded
//! queue, so the core never needs locks. Commands produced by the core are
//! handed to the injected collaborators: the file service, the peer-wire
//! layer and the tracker client. Their results come back as events posted
//! through a [`SwarmHandle`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bitvec::prelude::*;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::SwarmConfig;
use crate::error::{Result, SwarmError};
use crate::torrent::{Command, ResumeState, Swarm, SwarmEvent, SwarmNotice};
use crate::types::{BlockRequest, PeerId, SwarmStatus, TorrentLayout};

/// Maximum number of notices to buffer per subscriber
const NOTICE_CHANNEL_CAPACITY: usize = 1024;

/// Disk side: verification, block storage and reads for uploads.
///
/// Calls must not block; results are posted back as
/// [`SwarmEvent::VerificationDone`], [`SwarmEvent::PieceVerified`],
/// [`SwarmEvent::BlockRead`] or [`SwarmEvent::FileError`].
pub trait FileService: Send + Sync {
    fn start_verification(&self);
    fn write_block(&self, piece: u32, offset: u32, data: Bytes);
    fn verify_piece(&self, piece: u32);
    fn read_block(&self, peer: PeerId, request: BlockRequest);
}

/// Peer-wire layer: outbound messages and connection management
pub trait PeerWire: Send + Sync {
    fn connect(&self, addr: SocketAddr);
    fn disconnect(&self, peer: PeerId);
    fn send_interested(&self, peer: PeerId, interested: bool);
    fn send_bitfield(&self, peer: PeerId, bitfield: &BitSlice<u8, Msb0>);
    fn send_have(&self, peer: PeerId, piece: u32);
    fn request_block(&self, peer: PeerId, request: BlockRequest);
    fn cancel_request(&self, peer: PeerId, request: BlockRequest);
    fn send_block(&self, peer: PeerId, piece: u32, offset: u32, data: Bytes);
    fn set_choked(&self, peer: PeerId, choked: bool);
}

/// Tracker announces
pub trait TrackerClient: Send + Sync {
    fn start(&self);
    fn start_seeding(&self);
    /// Must eventually be answered with [`SwarmEvent::TrackerStopped`]
    fn stop(&self);
}

/// The collaborators an engine talks to
#[derive(Clone)]
pub struct SwarmServices {
    pub files: Arc<dyn FileService>,
    pub wire: Arc<dyn PeerWire>,
    pub tracker: Arc<dyn TrackerClient>,
}

impl SwarmServices {
    /// Hand one command to whichever collaborator owns it
    fn execute(&self, command: Command) {
        match command {
            Command::SendInterested(peer) => self.wire.send_interested(peer, true),
            Command::SendNotInterested(peer) => self.wire.send_interested(peer, false),
            Command::SendBitfield { peer, bitfield } => self.wire.send_bitfield(peer, &bitfield),
            Command::SendHave { peer, piece } => self.wire.send_have(peer, piece),
            Command::RequestBlock { peer, request } => self.wire.request_block(peer, request),
            Command::CancelRequest { peer, request } => self.wire.cancel_request(peer, request),
            Command::SendBlock {
                peer,
                piece,
                offset,
                data,
            } => self.wire.send_block(peer, piece, offset, data),
            Command::ChokePeer(peer) => self.wire.set_choked(peer, true),
            Command::UnchokePeer(peer) => self.wire.set_choked(peer, false),
            Command::Disconnect(peer) => self.wire.disconnect(peer),
            Command::Connect(addr) => self.wire.connect(addr),

            Command::StartVerification => self.files.start_verification(),
            Command::WriteBlock {
                piece,
                offset,
                data,
            } => self.files.write_block(piece, offset, data),
            Command::VerifyPiece(piece) => self.files.verify_piece(piece),
            Command::ReadBlock { peer, request } => self.files.read_block(peer, request),

            Command::TrackerStart => self.tracker.start(),
            Command::TrackerStartSeeding => self.tracker.start_seeding(),
            Command::TrackerStop => self.tracker.stop(),

            // Handled by the engine loop itself
            Command::Reschedule | Command::ConnectPeers => {}
        }
    }
}

enum EngineMessage {
    Event(SwarmEvent),
    Snapshot(oneshot::Sender<ResumeState>),
}

/// Builder and task body for one torrent's scheduling core
pub struct SwarmEngine {
    swarm: Swarm,
}

impl SwarmEngine {
    /// Create an engine without starting it
    pub fn new(config: SwarmConfig, layout: TorrentLayout) -> Result<Self> {
        Ok(Self {
            swarm: Swarm::new(config, layout)?,
        })
    }

    /// Restore partial pieces from an earlier session
    pub fn with_resume(mut self, resume: &ResumeState) -> Result<Self> {
        self.swarm.restore(resume)?;
        Ok(self)
    }

    /// Create and spawn an engine in one step
    pub fn spawn(
        config: SwarmConfig,
        layout: TorrentLayout,
        services: SwarmServices,
    ) -> Result<SwarmHandle> {
        Ok(Self::new(config, layout)?.run(services))
    }

    /// Spawn the engine task on the current tokio runtime.
    ///
    /// The task ends once every [`SwarmHandle`] is dropped.
    pub fn run(self, services: SwarmServices) -> SwarmHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (notice_tx, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let status = Arc::new(RwLock::new(self.swarm.status()));

        let handle = SwarmHandle {
            tx: tx.clone(),
            notice_tx: notice_tx.clone(),
            status: Arc::clone(&status),
        };

        let task = EngineTask {
            swarm: self.swarm,
            services,
            self_tx: tx.downgrade(),
            notice_tx,
            status,
        };
        tokio::spawn(task.run(rx));
        handle
    }
}

struct EngineTask {
    swarm: Swarm,
    services: SwarmServices,
    /// Weak, so the task stops when all handles are gone
    self_tx: mpsc::WeakUnboundedSender<EngineMessage>,
    notice_tx: broadcast::Sender<SwarmNotice>,
    status: Arc<RwLock<SwarmStatus>>,
}

impl EngineTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineMessage>) {
        let mut choke_timer = tokio::time::interval(self.swarm.config().upload_schedule_interval());
        choke_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(EngineMessage::Event(event)) => self.process(event),
                    Some(EngineMessage::Snapshot(reply)) => {
                        let _ = reply.send(self.swarm.resume_state());
                    }
                    None => break,
                },
                _ = choke_timer.tick() => self.process(SwarmEvent::ChokeTick),
            }
        }
        tracing::debug!("swarm engine task finished");
    }

    fn process(&mut self, event: SwarmEvent) {
        let out = self.swarm.handle(event, Instant::now());

        for command in out.commands {
            match command {
                Command::Reschedule => self.post_self(SwarmEvent::ScheduleTick),
                Command::ConnectPeers => self.post_self(SwarmEvent::ConnectTick),
                command => self.services.execute(command),
            }
        }

        *self.status.write() = self.swarm.status();
        for notice in out.notices {
            // No subscribers is fine.
            let _ = self.notice_tx.send(notice);
        }
    }

    /// Queue a follow-up behind whatever is already waiting
    fn post_self(&self, event: SwarmEvent) {
        if let Some(tx) = self.self_tx.upgrade() {
            let _ = tx.send(EngineMessage::Event(event));
        }
    }
}

/// Cloneable handle to a running engine
#[derive(Clone)]
pub struct SwarmHandle {
    tx: mpsc::UnboundedSender<EngineMessage>,
    notice_tx: broadcast::Sender<SwarmNotice>,
    status: Arc<RwLock<SwarmStatus>>,
}

impl SwarmHandle {
    /// Post an event to the engine
    pub fn post(&self, event: SwarmEvent) -> Result<()> {
        self.tx.send(EngineMessage::Event(event))?;
        Ok(())
    }

    /// Begin the session
    pub fn start(&self) -> Result<()> {
        self.post(SwarmEvent::Start)
    }

    /// Abort all connections and shut down.
    ///
    /// Completion is reported as [`SwarmNotice::Stopped`].
    pub fn stop(&self) -> Result<()> {
        self.post(SwarmEvent::Stop)
    }

    /// Pause or resume the transfer
    pub fn pause(&self, paused: bool) -> Result<()> {
        self.post(if paused {
            SwarmEvent::Pause
        } else {
            SwarmEvent::Resume
        })
    }

    /// Subscribe to notices
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmNotice> {
        self.notice_tx.subscribe()
    }

    /// Latest status snapshot
    pub fn status(&self) -> SwarmStatus {
        self.status.read().clone()
    }

    /// Current progress in a form that can be saved and restored
    pub async fn resume_state(&self) -> Result<ResumeState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineMessage::Snapshot(reply))
            .map_err(|_| SwarmError::Shutdown)?;
        rx.await.map_err(|_| SwarmError::Shutdown)
    }
}
