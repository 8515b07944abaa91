//! # gosh-swarm
//!
//! Piece/block scheduling and choking for a BitTorrent swarm.
//!
//! ## Features
//!
//! - **Block scheduling**: per-peer request pipelines with warm-up and
//!   endgame racing, rarest-first and partial-piece recovery
//! - **Choking**: rate-ranked upload slots with optimistic unchoke
//! - **Transfer state machine**: Preparing through Seeding, pause and stop
//! - **Peer selection**: weighted choice of which known peers to dial
//! - **Async**: a single Tokio task drives the core; I/O stays outside
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gosh_swarm::{SwarmConfig, SwarmEngine, SwarmServices, TorrentLayout};
//!
//! # async fn run(services: SwarmServices) -> Result<(), Box<dyn std::error::Error>> {
//! let layout = TorrentLayout::new(700 * 1024 * 1024, 256 * 1024)?;
//! let handle = SwarmEngine::spawn(SwarmConfig::default(), layout, services)?;
//!
//! // Subscribe to notices
//! let mut notices = handle.subscribe();
//! handle.start()?;
//! while let Ok(notice) = notices.recv().await {
//!     println!("Notice: {:?}", notice);
//! }
//! # Ok(())
//! # }
//! ```

// Modules
pub mod config;
pub mod engine;
pub mod error;
pub mod torrent;
pub mod types;

// Re-exports for convenience
pub use config::{SwarmConfig, BLOCK_SIZE};
pub use engine::{FileService, PeerWire, SwarmEngine, SwarmHandle, SwarmServices, TrackerClient};
pub use error::{ProtocolErrorKind, Result, SwarmError};
pub use types::{BlockRequest, PeerId, PeerInfo, SwarmStatus, TorrentLayout, TransferState};

pub use torrent::{
    Command, Outbox, PeerStats, ResumeState, Swarm, SwarmEvent, SwarmNotice,
};
