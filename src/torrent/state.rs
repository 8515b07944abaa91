//! Transfer state machine
//!
//! Tracks the client-level phase of a transfer and rejects transitions that
//! make no sense from the current phase. Every change is logged and reported
//! as a [`SwarmNotice::StateChanged`].

use super::events::{Outbox, SwarmNotice};
use crate::error::{Result, SwarmError};
use crate::types::TransferState;

/// Completion figures the state machine needs to pick the next phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub completed: u32,
    pub piece_count: u32,
    pub incomplete: u32,
    /// Pieces with a claim or partial data
    pub pending: usize,
}

impl Completion {
    pub fn is_finished(&self) -> bool {
        self.completed == self.piece_count
    }
}

/// Phase tracker for one transfer
#[derive(Debug)]
pub struct TransferStateMachine {
    state: TransferState,
    endgame_piece_threshold: usize,
}

impl TransferStateMachine {
    pub fn new(endgame_piece_threshold: usize) -> Self {
        Self {
            state: TransferState::Idle,
            endgame_piece_threshold,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    fn set(&mut self, new_state: TransferState, out: &mut Outbox) {
        if new_state == self.state {
            return;
        }
        let old_state = self.state;
        self.state = new_state;
        tracing::info!(from = %old_state, to = %new_state, "transfer state changed");
        out.notify(SwarmNotice::StateChanged {
            old_state,
            new_state,
        });
    }

    /// `Idle -> Preparing`
    pub fn start(&mut self, out: &mut Outbox) -> Result<()> {
        if self.state != TransferState::Idle {
            return Err(SwarmError::invalid_state("start", self.state));
        }
        self.set(TransferState::Preparing, out);
        Ok(())
    }

    /// `Preparing -> Seeding | Searching` once on-disk verification finished
    pub fn verification_done(&mut self, completion: Completion, out: &mut Outbox) -> Result<()> {
        if self.state != TransferState::Preparing {
            return Err(SwarmError::invalid_state("finish verification", self.state));
        }
        let next = if completion.is_finished() {
            TransferState::Seeding
        } else {
            TransferState::Searching
        };
        self.set(next, out);
        Ok(())
    }

    /// `Searching -> Connecting` when the connector starts dialing
    pub fn connecting(&mut self, out: &mut Outbox) {
        if self.state == TransferState::Searching {
            self.set(TransferState::Connecting, out);
        }
    }

    /// A peer finished its handshake
    pub fn handshake_complete(&mut self, completion: Completion, out: &mut Outbox) {
        if !matches!(
            self.state,
            TransferState::Searching | TransferState::Connecting
        ) {
            return;
        }
        if completion.completed == 0 {
            self.set(TransferState::WarmingUp, out);
        } else {
            self.check_endgame(completion, out);
        }
    }

    /// A block arrived; leaves warm-up or the connect phases once something
    /// is complete
    pub fn block_received(&mut self, completion: Completion, out: &mut Outbox) {
        if completion.completed == 0 {
            return;
        }
        if matches!(
            self.state,
            TransferState::Searching | TransferState::Connecting | TransferState::WarmingUp
        ) {
            self.set(TransferState::Downloading, out);
        }
    }

    /// A piece passed verification.
    ///
    /// Returns `true` if this completed the transfer and the tracker should
    /// switch to seeding announcements.
    pub fn piece_verified(&mut self, completion: Completion, out: &mut Outbox) -> bool {
        if !self.state.is_active() {
            return false;
        }
        if completion.is_finished() {
            if self.state == TransferState::Seeding {
                return false;
            }
            self.set(TransferState::Seeding, out);
            return true;
        }
        if completion.completed == 1 && self.state != TransferState::Endgame {
            self.set(TransferState::Downloading, out);
        }
        self.check_endgame(completion, out);
        false
    }

    /// Enter endgame when few pieces remain and claims cover all of them
    pub fn check_endgame(&mut self, completion: Completion, out: &mut Outbox) {
        if !self.state.is_active()
            || matches!(self.state, TransferState::Seeding | TransferState::Endgame)
        {
            return;
        }
        let incomplete = completion.incomplete as usize;
        // Pending pieces are a subset of incomplete ones, so equality is the cap.
        if incomplete > 0
            && incomplete < self.endgame_piece_threshold
            && completion.pending >= incomplete
        {
            self.set(TransferState::Endgame, out);
        }
    }

    /// Any active phase `-> Paused`
    pub fn pause(&mut self, out: &mut Outbox) -> Result<()> {
        if !self.state.is_active() {
            return Err(SwarmError::invalid_state("pause", self.state));
        }
        self.set(TransferState::Paused, out);
        Ok(())
    }

    /// `Paused -> Seeding | Searching`
    pub fn resume(&mut self, completion: Completion, out: &mut Outbox) -> Result<()> {
        if self.state != TransferState::Paused {
            return Err(SwarmError::invalid_state("resume", self.state));
        }
        let next = if completion.is_finished() {
            TransferState::Seeding
        } else {
            TransferState::Searching
        };
        self.set(next, out);
        Ok(())
    }

    /// Enter `Stopping`.
    ///
    /// Returns whether the tracker was ever started; if not, the machine goes
    /// straight back to `Idle`.
    pub fn stop(&mut self, out: &mut Outbox) -> Result<bool> {
        let old = self.state;
        match old {
            TransferState::Idle | TransferState::Stopping => {
                Err(SwarmError::invalid_state("stop", old))
            }
            _ => {
                self.set(TransferState::Stopping, out);
                if old == TransferState::Preparing {
                    self.set(TransferState::Idle, out);
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }

    /// `Stopping -> Idle` once the tracker acknowledged
    pub fn stopped(&mut self, out: &mut Outbox) {
        if self.state == TransferState::Stopping {
            self.set(TransferState::Idle, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(completed: u32, piece_count: u32, pending: usize) -> Completion {
        Completion {
            completed,
            piece_count,
            incomplete: piece_count - completed,
            pending,
        }
    }

    fn states(out: &Outbox) -> Vec<TransferState> {
        out.notices
            .iter()
            .filter_map(|n| match n {
                SwarmNotice::StateChanged { new_state, .. } => Some(*new_state),
                _ => None,
            })
            .collect()
    }

    fn running(fresh: bool) -> (TransferStateMachine, Outbox) {
        let mut sm = TransferStateMachine::new(5);
        let mut out = Outbox::new();
        sm.start(&mut out).unwrap();
        let done = if fresh { 0 } else { 3 };
        sm.verification_done(completion(done, 20, 0), &mut out).unwrap();
        (sm, out)
    }

    #[test]
    fn test_fresh_download_path() {
        let (mut sm, mut out) = running(true);
        sm.connecting(&mut out);
        sm.handshake_complete(completion(0, 20, 0), &mut out);
        sm.block_received(completion(0, 20, 1), &mut out);
        assert_eq!(sm.state(), TransferState::WarmingUp);
        sm.piece_verified(completion(1, 20, 3), &mut out);

        assert_eq!(
            states(&out),
            vec![
                TransferState::Preparing,
                TransferState::Searching,
                TransferState::Connecting,
                TransferState::WarmingUp,
                TransferState::Downloading,
            ]
        );
    }

    #[test]
    fn test_complete_data_goes_straight_to_seeding() {
        let mut sm = TransferStateMachine::new(5);
        let mut out = Outbox::new();
        sm.start(&mut out).unwrap();
        sm.verification_done(completion(8, 8, 0), &mut out).unwrap();
        assert_eq!(sm.state(), TransferState::Seeding);
    }

    #[test]
    fn test_endgame_requires_claims_covering_remaining_work() {
        let (mut sm, mut out) = running(false);
        sm.handshake_complete(completion(3, 20, 0), &mut out);
        sm.block_received(completion(3, 20, 1), &mut out);
        assert_eq!(sm.state(), TransferState::Downloading);

        sm.piece_verified(completion(16, 20, 2), &mut out);
        assert_eq!(sm.state(), TransferState::Downloading);
        sm.piece_verified(completion(17, 20, 3), &mut out);
        assert_eq!(sm.state(), TransferState::Endgame);
    }

    #[test]
    fn test_last_piece_enters_seeding_once() {
        let (mut sm, mut out) = running(false);
        sm.block_received(completion(3, 20, 1), &mut out);
        assert!(sm.piece_verified(completion(20, 20, 0), &mut out));
        assert_eq!(sm.state(), TransferState::Seeding);
        assert!(!sm.piece_verified(completion(20, 20, 0), &mut out));
    }

    #[test]
    fn test_pause_and_resume() {
        let (mut sm, mut out) = running(false);
        sm.pause(&mut out).unwrap();
        assert_eq!(sm.state(), TransferState::Paused);
        assert!(sm.pause(&mut out).is_err());
        sm.resume(completion(3, 20, 0), &mut out).unwrap();
        assert_eq!(sm.state(), TransferState::Searching);
    }

    #[test]
    fn test_stop_before_tracker_goes_idle() {
        let mut sm = TransferStateMachine::new(5);
        let mut out = Outbox::new();
        sm.start(&mut out).unwrap();
        assert!(!sm.stop(&mut out).unwrap());
        assert_eq!(sm.state(), TransferState::Idle);
    }

    #[test]
    fn test_stop_waits_for_tracker() {
        let (mut sm, mut out) = running(true);
        assert!(sm.stop(&mut out).unwrap());
        assert_eq!(sm.state(), TransferState::Stopping);
        assert!(sm.stop(&mut out).is_err());
        sm.stopped(&mut out);
        assert_eq!(sm.state(), TransferState::Idle);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut sm = TransferStateMachine::new(5);
        let mut out = Outbox::new();
        assert!(sm.resume(completion(0, 4, 0), &mut out).is_err());
        assert!(sm.verification_done(completion(0, 4, 0), &mut out).is_err());
        assert!(sm.stop(&mut out).is_err());
        sm.start(&mut out).unwrap();
        assert!(matches!(
            sm.start(&mut out),
            Err(SwarmError::InvalidState { action: "start", .. })
        ));
    }
}
