//! Acoustic unlock library
//!
//! Listens to a microphone for a sustained loud sound, asks a remote service
//! whether the phrase is authorized (first cheaply, then with a recorded clip)
//! and triggers a smart-lock actuator on success. A supervisor keeps detector
//! instances running across device and network failures.

pub mod actuator;
pub mod analyzer;
pub mod authorization;
pub mod capture_buffer;
pub mod config;
pub mod detector;
pub mod logging;
pub mod notifier;
pub mod recorder;
pub mod source;
pub mod supervisor;
pub mod tracker;
pub mod verification;

// Re-export main types
pub use actuator::{ActuatorError, SwitchBotActuator, UnlockActuator, UNLOCK_COMMAND};
pub use analyzer::{AnalyzerError, AudioBlock, AudioSample, FrameAnalysis, FrameAnalyzer};
pub use authorization::{
    AuthorizationPhase, AuthorizationState, BlockDecision, PhraseAuthorizer, VerificationKind,
};
pub use config::{ConfigError, UnlockConfig};
pub use detector::{DetectorError, DetectorStats, UnlockDetector};
pub use logging::{LastLogLine, LogFile, LogHandle, LoggingError};
pub use notifier::{LogNotifier, Notifier, NotifyError, SlackNotifier};
pub use recorder::{Clip, ClipRecorder, RecordingError};
pub use source::{CpalSource, CpalSourceFactory, SampleSource, SourceError, SourceFactory};
pub use supervisor::{Supervisor, SupervisorError, SupervisorReport, SupervisorState};
pub use tracker::{FrameState, TriggerWindowTracker};
pub use verification::{
    HttpVerificationClient, VerificationClient, VerificationError, VerificationResult,
};
