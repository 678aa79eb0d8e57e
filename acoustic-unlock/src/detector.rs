//! Unlock detector
//!
//! One detector instance owns one sample source and drives the per-block
//! loop: analyze the block, let the authorizer decide, then probe or confirm.
//! Capture and verification are serialized. Audio that piles up in the source
//! while a verification or unlock call is in flight is discarded, so the next
//! analyzed block and the next clip always start from live audio.

use crate::actuator::{ActuatorError, UnlockActuator, UNLOCK_COMMAND};
use crate::analyzer::{AnalyzerError, AudioBlock, FrameAnalyzer};
use crate::authorization::{
    AuthorizationPhase, AuthorizationState, BlockDecision, PhraseAuthorizer, VerificationKind,
};
use crate::config::UnlockConfig;
use crate::recorder::{ClipRecorder, RecordingError};
use crate::source::{SampleSource, SourceError};
use crate::tracker::FrameState;
use crate::verification::{VerificationClient, VerificationError};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Invalid block: {0}")]
    InvalidBlock(#[from] AnalyzerError),

    #[error("Sample source error: {0}")]
    Source(#[from] SourceError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    #[error("Unlock actuator error: {0}")]
    Actuator(#[from] ActuatorError),
}

impl DetectorError {
    /// Whether the error ends the detector instance
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DetectorError::InvalidBlock(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorStats {
    pub blocks_processed: u64,
    pub invalid_blocks: u64,
    pub probes: u64,
    pub confirmations: u64,
    pub unlocks: u64,
    pub discarded_samples: u64,
}

/// Detector instance bound to one sample source
pub struct UnlockDetector<S: SampleSource> {
    source: S,
    analyzer: FrameAnalyzer,
    authorizer: PhraseAuthorizer,
    recorder: ClipRecorder,
    verifier: Arc<dyn VerificationClient>,
    actuator: Arc<dyn UnlockActuator>,
    unlock_device_id: String,
    stats: DetectorStats,
}

impl<S: SampleSource> UnlockDetector<S> {
    /// Create a detector with fresh frame and authorization state
    pub fn new(
        config: &UnlockConfig,
        source: S,
        verifier: Arc<dyn VerificationClient>,
        actuator: Arc<dyn UnlockActuator>,
    ) -> Self {
        let authorizer = PhraseAuthorizer::from_config(config);

        debug!(
            "Detector thresholds: amplitude > {}, {} consecutive blocks, {} interval blocks",
            config.threshold, config.consecutive_frames_threshold, config.interval_frames_threshold
        );

        Self {
            source,
            analyzer: FrameAnalyzer::from_config(config),
            authorizer,
            recorder: ClipRecorder::from_config(config),
            verifier,
            actuator,
            unlock_device_id: config.unlock_device_id.clone(),
            stats: DetectorStats::default(),
        }
    }

    /// Run until cancelled or a fatal error occurs
    ///
    /// Returns `Ok(())` only on cancellation. Invalid blocks are logged and
    /// skipped; every other error ends the instance.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), DetectorError> {
        info!("Detector listening");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Detector stopped by cancellation");
                    return Ok(());
                }

                result = self.step() => match result {
                    Ok(_) => {}
                    Err(e) if !e.is_fatal() => warn!("Skipping block: {}", e),
                    Err(e) => return Err(e),
                },
            }
        }
    }

    async fn step(&mut self) -> Result<BlockDecision, DetectorError> {
        let block = self.source.read_block().await?;
        self.process_block(block).await
    }

    /// Handle one block: analyze it, then probe, confirm or just count
    pub async fn process_block(&mut self, block: AudioBlock) -> Result<BlockDecision, DetectorError> {
        self.stats.blocks_processed += 1;

        if self.stats.blocks_processed % 1000 == 0 {
            debug!(
                "Processed {} blocks ({} invalid), {} probes, {} confirmations, {} unlocks",
                self.stats.blocks_processed,
                self.stats.invalid_blocks,
                self.stats.probes,
                self.stats.confirmations,
                self.stats.unlocks
            );
        }

        let analysis = self.analyzer.analyze(&block).map_err(|e| {
            self.stats.invalid_blocks += 1;
            e
        })?;

        let decision = self.authorizer.decide(analysis.above_threshold);
        match decision {
            BlockDecision::Confirm => self.confirm().await?,
            BlockDecision::Probe => self.probe(analysis.amplitude).await?,
            BlockDecision::Observe => {}
        }

        Ok(decision)
    }

    async fn probe(&mut self, amplitude: f32) -> Result<(), DetectorError> {
        self.stats.probes += 1;
        info!("Candidate event (amplitude {:.3}), requesting verification", amplitude);

        let result = self.verifier.verify().await?;
        self.authorizer.apply(VerificationKind::Probe, result);
        self.discard_stale_audio();

        Ok(())
    }

    async fn confirm(&mut self) -> Result<(), DetectorError> {
        self.stats.confirmations += 1;
        info!("Confirmation event, recording clip");

        self.discard_stale_audio();
        let clip = self.recorder.record(&mut self.source).await?;
        let path = self.recorder.save(&clip)?;

        let result = self.verifier.verify_with_clip(&path).await?;
        if self.authorizer.apply(VerificationKind::Clip, result) == AuthorizationPhase::Unlocked {
            let response = self
                .actuator
                .control(&self.unlock_device_id, UNLOCK_COMMAND)
                .await?;
            self.stats.unlocks += 1;
            info!("Unlocked {}: {}", self.unlock_device_id, response.trim());
        }
        self.discard_stale_audio();

        Ok(())
    }

    fn discard_stale_audio(&mut self) {
        let discarded = self.source.discard_pending();
        if discarded > 0 {
            self.stats.discarded_samples += discarded as u64;
            debug!("Discarded {} buffered samples", discarded);
        }
    }

    pub fn stats(&self) -> DetectorStats {
        self.stats
    }

    pub fn authorization(&self) -> AuthorizationState {
        self.authorizer.state()
    }

    pub fn frame_state(&self) -> FrameState {
        self.authorizer.frame_state()
    }

    /// Release the sample source
    pub fn close(&mut self) -> Result<(), SourceError> {
        self.source.close()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }
}
