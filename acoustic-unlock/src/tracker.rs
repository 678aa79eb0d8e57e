//! Trigger window tracking
//!
//! Turns the per-block "above threshold" signal into a debounced candidate
//! event. Isolated spikes are filtered by the consecutive-frame counter and
//! repeated triggers are rate limited by the interval-frame counter.

use crate::config::UnlockConfig;
use tracing::debug;

/// Frame counters owned by one detector instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameState {
    /// Contiguous above-threshold blocks, cleared by any quiet block
    pub consecutive_frames: u32,

    /// Blocks seen since the last reset
    pub interval_frames: u32,
}

/// Debounce and rate-limit tracker for loud blocks
#[derive(Debug, Clone)]
pub struct TriggerWindowTracker {
    consecutive_threshold: u32,
    interval_threshold: u32,
    state: FrameState,
}

impl TriggerWindowTracker {
    /// Create a tracker whose interval counter starts pre-warmed, so the very
    /// first trigger is not held back by rate limiting
    pub fn new(consecutive_threshold: u32, interval_threshold: u32) -> Self {
        Self {
            consecutive_threshold,
            interval_threshold,
            state: FrameState {
                consecutive_frames: 0,
                interval_frames: interval_threshold,
            },
        }
    }

    pub fn from_config(config: &UnlockConfig) -> Self {
        Self::new(
            config.consecutive_frames_threshold,
            config.interval_frames_threshold,
        )
    }

    /// Account for one block and report whether it completes a candidate event
    ///
    /// Counters are updated first, then the candidate condition is checked:
    /// the block must be loud, the loud run must be long enough and enough
    /// blocks must have passed since the last reset. Firing resets both counters.
    pub fn observe(&mut self, above_threshold: bool) -> bool {
        self.tick();

        if above_threshold {
            self.state.consecutive_frames = self.state.consecutive_frames.saturating_add(1);
        } else {
            self.state.consecutive_frames = 0;
        }

        let fired = above_threshold
            && self.state.consecutive_frames >= self.consecutive_threshold
            && self.state.interval_frames >= self.interval_threshold;

        if fired {
            debug!(
                "Candidate event: consecutive={}, interval={}",
                self.state.consecutive_frames, self.state.interval_frames
            );
            self.reset();
        }

        fired
    }

    /// Advance the interval counter only; used for blocks consumed by a
    /// confirmation event
    pub fn tick(&mut self) {
        self.state.interval_frames = self.state.interval_frames.saturating_add(1);
    }

    /// Clear both counters (full cooldown)
    pub fn reset(&mut self) {
        self.state = FrameState::default();
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn consecutive_threshold(&self) -> u32 {
        self.consecutive_threshold
    }

    pub fn interval_threshold(&self) -> u32 {
        self.interval_threshold
    }
}
