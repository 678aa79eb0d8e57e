//! Two-phase phrase authorization
//!
//! A cheap probe (no audio) opens the door for a stronger confirmation
//! (recorded clip) which is the only path to the unlock. The state machine
//! owns both the authorization flags and the trigger window counters so the
//! per-block decision and the outcome handling see one consistent state.
//!
//! Phases:
//! - `Idle`: not authorized
//! - `AwaitingConfirmation`: a verification succeeded, next loud block confirms
//! - `Unlocked`: a clip verification succeeded; the retry grace makes the very
//!   next block a confirmation even if it is quiet

use crate::config::UnlockConfig;
use crate::tracker::{FrameState, TriggerWindowTracker};
use crate::verification::VerificationResult;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthorizationState {
    pub is_phrase_authorized: bool,
    pub is_retry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationPhase {
    Idle,
    AwaitingConfirmation,
    Unlocked,
}

impl AuthorizationState {
    pub fn phase(&self) -> AuthorizationPhase {
        match (self.is_phrase_authorized, self.is_retry) {
            (false, _) => AuthorizationPhase::Idle,
            (true, false) => AuthorizationPhase::AwaitingConfirmation,
            (true, true) => AuthorizationPhase::Unlocked,
        }
    }
}

/// Which verification call produced an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationKind {
    /// Lightweight call without audio
    Probe,

    /// Full call with the recorded clip
    Clip,
}

/// What the detector must do with the current block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDecision {
    /// Record a clip and submit it for full verification
    Confirm,

    /// Issue the lightweight verification call
    Probe,

    /// Counters updated, no remote call
    Observe,
}

/// Phrase authorization state machine
#[derive(Debug, Clone)]
pub struct PhraseAuthorizer {
    state: AuthorizationState,
    tracker: TriggerWindowTracker,
}

impl PhraseAuthorizer {
    pub fn new(tracker: TriggerWindowTracker) -> Self {
        Self {
            state: AuthorizationState::default(),
            tracker,
        }
    }

    pub fn from_config(config: &UnlockConfig) -> Self {
        Self::new(TriggerWindowTracker::from_config(config))
    }

    /// Decide what to do with one block, updating the counters accordingly
    ///
    /// Priority: confirmation, then candidate event, then plain counting.
    pub fn decide(&mut self, above_threshold: bool) -> BlockDecision {
        if self.is_confirmation(above_threshold) {
            self.tracker.tick();
            return BlockDecision::Confirm;
        }

        if self.tracker.observe(above_threshold) {
            return BlockDecision::Probe;
        }

        BlockDecision::Observe
    }

    /// Confirmation condition: loud (or retry grace) while authorized
    pub fn is_confirmation(&self, above_threshold: bool) -> bool {
        (above_threshold || self.state.is_retry) && self.state.is_phrase_authorized
    }

    /// Apply a verification outcome and return the resulting phase
    ///
    /// Approval keeps the counters untouched so the debounce state carries into
    /// the confirmation. Denial clears both flags and both counters.
    pub fn apply(&mut self, kind: VerificationKind, result: VerificationResult) -> AuthorizationPhase {
        if result.authorized {
            self.state.is_phrase_authorized = true;
            self.state.is_retry = kind == VerificationKind::Clip;
            info!("Phrase verification approved ({:?})", kind);
        } else {
            self.state = AuthorizationState::default();
            self.tracker.reset();
            info!("Phrase verification denied ({:?}), cooling down", kind);
        }

        let phase = self.state.phase();
        debug!("Authorization phase: {:?}", phase);
        phase
    }

    pub fn state(&self) -> AuthorizationState {
        self.state
    }

    pub fn phase(&self) -> AuthorizationPhase {
        self.state.phase()
    }

    pub fn frame_state(&self) -> FrameState {
        self.tracker.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authorizer() -> PhraseAuthorizer {
        PhraseAuthorizer::new(TriggerWindowTracker::new(3, 5))
    }

    fn drive_to_probe(auth: &mut PhraseAuthorizer) {
        assert_eq!(auth.decide(true), BlockDecision::Observe);
        assert_eq!(auth.decide(true), BlockDecision::Observe);
        assert_eq!(auth.decide(true), BlockDecision::Probe);
    }

    #[test]
    fn test_starts_idle() {
        let auth = authorizer();
        assert_eq!(auth.phase(), AuthorizationPhase::Idle);
        assert!(!auth.is_confirmation(true));
    }

    #[test]
    fn test_quiet_blocks_only_observe() {
        let mut auth = authorizer();
        for _ in 0..100 {
            assert_eq!(auth.decide(false), BlockDecision::Observe);
        }
        assert_eq!(auth.frame_state().consecutive_frames, 0);
    }

    #[test]
    fn test_probe_approval_awaits_confirmation() {
        let mut auth = authorizer();
        drive_to_probe(&mut auth);

        let phase = auth.apply(VerificationKind::Probe, VerificationResult::authorized());
        assert_eq!(phase, AuthorizationPhase::AwaitingConfirmation);
        assert!(!auth.state().is_retry);

        // Quiet block does not confirm, loud block does
        assert_eq!(auth.decide(false), BlockDecision::Observe);
        assert_eq!(auth.decide(true), BlockDecision::Confirm);
    }

    #[test]
    fn test_approval_keeps_counters() {
        let mut auth = authorizer();
        auth.decide(true);
        let before = auth.frame_state();

        auth.apply(VerificationKind::Probe, VerificationResult::authorized());
        assert_eq!(auth.frame_state(), before);
    }

    #[test]
    fn test_clip_approval_grants_retry_grace() {
        let mut auth = authorizer();
        drive_to_probe(&mut auth);
        auth.apply(VerificationKind::Probe, VerificationResult::authorized());
        assert_eq!(auth.decide(true), BlockDecision::Confirm);

        let phase = auth.apply(VerificationKind::Clip, VerificationResult::authorized());
        assert_eq!(phase, AuthorizationPhase::Unlocked);
        assert!(auth.state().is_retry);

        // Next block confirms again without crossing the threshold
        assert_eq!(auth.decide(false), BlockDecision::Confirm);
    }

    #[test]
    fn test_denial_resets_everything() {
        let mut auth = authorizer();
        drive_to_probe(&mut auth);
        auth.apply(VerificationKind::Probe, VerificationResult::authorized());
        auth.decide(true);

        let phase = auth.apply(VerificationKind::Clip, VerificationResult::denied());
        assert_eq!(phase, AuthorizationPhase::Idle);
        assert_eq!(auth.state(), AuthorizationState::default());
        assert_eq!(auth.frame_state(), FrameState::default());

        // Loud blocks cannot confirm, and a new probe waits for the interval window
        assert_eq!(auth.decide(true), BlockDecision::Observe);
        assert_eq!(auth.decide(true), BlockDecision::Observe);
        assert_eq!(auth.decide(true), BlockDecision::Observe);
        assert_eq!(auth.decide(true), BlockDecision::Observe);
        assert_eq!(auth.decide(true), BlockDecision::Probe);
    }

    #[test]
    fn test_probe_denial_from_idle() {
        let mut auth = authorizer();
        drive_to_probe(&mut auth);

        auth.apply(VerificationKind::Probe, VerificationResult::denied());
        assert_eq!(auth.phase(), AuthorizationPhase::Idle);
        assert!(!auth.is_confirmation(true));
    }

    #[test]
    fn test_confirmation_takes_priority_over_probe() {
        let mut auth = PhraseAuthorizer::new(TriggerWindowTracker::new(1, 1));
        assert_eq!(auth.decide(true), BlockDecision::Probe);
        auth.apply(VerificationKind::Probe, VerificationResult::authorized());

        // Candidate condition would hold too, but confirmation wins
        auth.decide(false);
        assert_eq!(auth.decide(true), BlockDecision::Confirm);
    }
}
