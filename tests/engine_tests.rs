//! Engine Tests
//!
//! Runs the swarm engine on a tokio runtime with fake collaborators and
//! observes it only through its handle: posted events, broadcast notices and
//! the status snapshot.

mod test_helpers;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bitvec::prelude::*;
use tokio::sync::broadcast;
use tokio::time::timeout;

use gosh_swarm::torrent::{PartialPiece, RESUME_VERSION};
use gosh_swarm::{
    ResumeState, SwarmConfig, SwarmEngine, SwarmError, SwarmEvent, SwarmNotice, TransferState,
};

use test_helpers::{layout, test_config, Call, FakeServices, BS};

/// Wait for the first notice matching `pred`
async fn wait_for(
    rx: &mut broadcast::Receiver<SwarmNotice>,
    pred: impl Fn(&SwarmNotice) -> bool,
) -> SwarmNotice {
    timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(notice) if pred(&notice) => return notice,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("engine stopped"),
            }
        }
    })
    .await
    .expect("timed out waiting for notice")
}

fn entered(state: TransferState) -> impl Fn(&SwarmNotice) -> bool {
    move |n| matches!(n, SwarmNotice::StateChanged { new_state, .. } if *new_state == state)
}

fn seed_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), port)
}

#[tokio::test]
async fn test_session_lifecycle() {
    let fake = FakeServices::recording();
    let handle = SwarmEngine::spawn(test_config(1), layout(4, 1), fake.services()).unwrap();
    let mut rx = handle.subscribe();

    handle.start().unwrap();
    wait_for(&mut rx, entered(TransferState::Preparing)).await;
    assert!(fake.has_call(&Call::StartVerification));

    handle
        .post(SwarmEvent::VerificationDone {
            completed: bitvec![u8, Msb0; 0; 4],
        })
        .unwrap();
    wait_for(&mut rx, entered(TransferState::Searching)).await;
    assert!(fake.has_call(&Call::TrackerStart));
    assert_eq!(handle.status().state, TransferState::Searching);

    handle.stop().unwrap();
    wait_for(&mut rx, entered(TransferState::Stopping)).await;
    assert!(fake.has_call(&Call::TrackerStop));

    handle.post(SwarmEvent::TrackerStopped).unwrap();
    wait_for(&mut rx, |n| *n == SwarmNotice::Stopped).await;
    assert_eq!(handle.status().state, TransferState::Idle);
}

#[tokio::test]
async fn test_pause_without_session_is_ignored() {
    let fake = FakeServices::recording();
    let handle = SwarmEngine::spawn(test_config(2), layout(4, 1), fake.services()).unwrap();
    let mut rx = handle.subscribe();

    handle.pause(true).unwrap();
    handle.start().unwrap();
    wait_for(&mut rx, entered(TransferState::Preparing)).await;
    assert_eq!(handle.status().state, TransferState::Preparing);
}

#[tokio::test]
async fn test_resume_snapshot_from_engine() {
    let snapshot = ResumeState {
        version: RESUME_VERSION,
        piece_count: 4,
        completed_pieces: Vec::new(),
        partial_pieces: vec![PartialPiece {
            index: 1,
            length: 2 * BS,
            completed_blocks: vec![0],
        }],
    };

    let fake = FakeServices::recording();
    let handle = SwarmEngine::new(test_config(3), layout(4, 2))
        .unwrap()
        .with_resume(&snapshot)
        .unwrap()
        .run(fake.services());

    let saved = handle.resume_state().await.unwrap();
    assert_eq!(saved, snapshot);
}

#[test]
fn test_invalid_config_is_rejected() {
    let fake = FakeServices::recording();
    let config = SwarmConfig {
        block_size: 0,
        ..SwarmConfig::default()
    };
    let result = SwarmEngine::spawn(config, layout(4, 1), fake.services());
    assert!(matches!(
        result,
        Err(SwarmError::InvalidInput {
            field: "block_size",
            ..
        })
    ));
}

#[tokio::test]
async fn test_download_through_engine() {
    let seeds = vec![seed_addr(7001), seed_addr(7002)];
    let fake = FakeServices::responding(seeds, 6);
    let handle = SwarmEngine::spawn(test_config(4), layout(6, 2), fake.services()).unwrap();
    fake.attach(handle.clone());
    let mut rx = handle.subscribe();

    handle.start().unwrap();
    wait_for(&mut rx, entered(TransferState::Seeding)).await;

    let status = handle.status();
    assert_eq!(status.completed_pieces, 6);
    assert_eq!(status.progress, 100);

    let calls = fake.calls();
    for piece in 0..6 {
        let verifications = calls
            .iter()
            .filter(|c| **c == Call::VerifyPiece(piece))
            .count();
        assert_eq!(verifications, 1, "piece {} verified once", piece);
    }
    assert!(calls.contains(&Call::TrackerStartSeeding));

    let saved = handle.resume_state().await.unwrap();
    assert_eq!(saved.completed_pieces, (0..6).collect::<Vec<u32>>());
    assert!(saved.partial_pieces.is_empty());
}
