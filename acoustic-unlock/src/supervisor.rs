//! Resilience supervisor
//!
//! Runs one detector instance at a time. Any failure tears the instance down,
//! notifies the operator, waits a fixed backoff and starts a fresh instance
//! with reset state. Cancellation is the only way out of the loop.
//!
//! Each instance runs on its own task so a panic is contained and treated as
//! a failure. The instance's source is closed by that task once the detector
//! returns; if the task panics, dropping the source releases it instead.

use crate::actuator::UnlockActuator;
use crate::config::UnlockConfig;
use crate::detector::{DetectorError, UnlockDetector};
use crate::logging::LastLogLine;
use crate::notifier::Notifier;
use crate::source::{SourceError, SourceFactory};
use crate::verification::VerificationClient;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to open sample source: {0}")]
    Open(#[source] SourceError),

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error("Detector task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    Backoff,
    Terminal,
}

/// Totals over one supervisor run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    /// Detector instances started (sources opened)
    pub instances: u64,

    /// Instances that ended in failure, including failed opens
    pub failures: u64,
}

pub struct Supervisor<F: SourceFactory> {
    config: UnlockConfig,
    factory: F,
    verifier: Arc<dyn VerificationClient>,
    actuator: Arc<dyn UnlockActuator>,
    notifier: Arc<dyn Notifier>,
    last_log: Option<LastLogLine>,
    backoff: Duration,
    state: SupervisorState,
    report: SupervisorReport,
}

impl<F: SourceFactory> Supervisor<F> {
    pub fn new(
        config: UnlockConfig,
        factory: F,
        verifier: Arc<dyn VerificationClient>,
        actuator: Arc<dyn UnlockActuator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let backoff = config.restart_backoff();

        Self {
            config,
            factory,
            verifier,
            actuator,
            notifier,
            last_log: None,
            backoff,
            state: SupervisorState::Running,
            report: SupervisorReport::default(),
        }
    }

    /// Quote this log capture in notifications instead of the bare message
    pub fn with_last_log(mut self, last_log: LastLogLine) -> Self {
        self.last_log = Some(last_log);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn report(&self) -> SupervisorReport {
        self.report
    }

    /// Supervise detector instances until `cancel` fires
    pub async fn run(&mut self, cancel: &CancellationToken) -> SupervisorReport {
        info!("Start AutoUnlock");
        self.notify("Start AutoUnlock").await;

        while !cancel.is_cancelled() {
            self.state = SupervisorState::Running;

            let failure = match self.run_instance(cancel).await {
                Ok(()) => break,
                Err(e) => e,
            };

            self.report.failures += 1;
            self.state = SupervisorState::Backoff;

            error!("Detector instance failed: {}", failure);
            let message = format!("Restart AutoUnlock in {:?}: {}", self.backoff, failure);
            warn!("{}", message);
            self.notify(&message).await;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        self.state = SupervisorState::Terminal;
        warn!("End AutoUnlock");
        self.notify("End AutoUnlock").await;

        info!(
            "Supervisor finished: {} instances, {} failures",
            self.report.instances, self.report.failures
        );
        self.report
    }

    /// Open a source, run one detector on it and tear it down
    ///
    /// `Ok(())` means the instance stopped because of cancellation.
    async fn run_instance(&mut self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        let source = self
            .factory
            .open(&self.config)
            .map_err(SupervisorError::Open)?;

        self.report.instances += 1;
        debug!("Detector instance {} starting", self.report.instances);

        let mut detector = UnlockDetector::new(
            &self.config,
            source,
            Arc::clone(&self.verifier),
            Arc::clone(&self.actuator),
        );
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let result = detector.run(&token).await;
            let closed = detector.close();
            (result, closed, detector.stats())
        });

        match task.await {
            Ok((result, closed, stats)) => {
                debug!("Detector instance stats: {:?}", stats);
                if let Err(e) = closed {
                    warn!("Failed to release sample source: {}", e);
                }
                result.map_err(SupervisorError::from)
            }
            Err(e) => Err(SupervisorError::Panicked(e.to_string())),
        }
    }

    /// Post the latest log line, or `fallback` when no capture is attached
    async fn notify(&self, fallback: &str) {
        let text = self
            .last_log
            .as_ref()
            .map(LastLogLine::get)
            .filter(|line| !line.is_empty())
            .unwrap_or_else(|| fallback.to_string());

        if let Err(e) = self.notifier.post(&text).await {
            warn!("Failed to send notification: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::MockUnlockActuator;
    use crate::analyzer::AudioBlock;
    use crate::logging::utc_offset;
    use crate::notifier::NotifyError;
    use crate::source::ScriptedSource;
    use crate::verification::MockVerificationClient;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tracing_subscriber::prelude::*;

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn post(&self, text: &str) -> Result<(), NotifyError> {
            self.messages.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    /// Fails the first `failures` opens, then hands out short scripts and
    /// cancels once `stop_after` sources have been opened
    struct FlakyFactory {
        failures: usize,
        opened: usize,
        stop_after: usize,
        cancel: CancellationToken,
    }

    impl SourceFactory for FlakyFactory {
        type Source = ScriptedSource;

        fn open(&mut self, _config: &UnlockConfig) -> Result<ScriptedSource, SourceError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(SourceError::NoDevice);
            }

            self.opened += 1;
            if self.opened >= self.stop_after {
                self.cancel.cancel();
            }
            Ok(ScriptedSource::new(vec![AudioBlock::filled(0, 800); 2]))
        }
    }

    fn supervisor(
        factory: FlakyFactory,
        notifier: Arc<RecordingNotifier>,
    ) -> Supervisor<FlakyFactory> {
        Supervisor::new(
            crate::config::test_config(),
            factory,
            Arc::new(MockVerificationClient::new()),
            Arc::new(MockUnlockActuator::new()),
            notifier,
        )
        .with_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_failed_instances_are_replaced() {
        let cancel = CancellationToken::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let factory = FlakyFactory {
            failures: 0,
            opened: 0,
            stop_after: 3,
            cancel: cancel.clone(),
        };

        let mut supervisor = supervisor(factory, Arc::clone(&notifier));
        let report = supervisor.run(&cancel).await;

        assert_eq!(report.instances, 3);
        assert_eq!(report.failures, 2);
        assert_eq!(supervisor.state(), SupervisorState::Terminal);

        let messages = notifier.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], "Start AutoUnlock");
        assert!(messages[1].starts_with("Restart AutoUnlock"));
        assert!(messages[1].contains("script exhausted"));
        assert_eq!(messages[3], "End AutoUnlock");
    }

    #[tokio::test]
    async fn test_open_failure_counts_as_failure() {
        let cancel = CancellationToken::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let factory = FlakyFactory {
            failures: 2,
            opened: 0,
            stop_after: 1,
            cancel: cancel.clone(),
        };

        let mut supervisor = supervisor(factory, Arc::clone(&notifier));
        let report = supervisor.run(&cancel).await;

        assert_eq!(report.instances, 1);
        assert_eq!(report.failures, 2);
        assert!(notifier.messages()[1].contains("No input device available"));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_is_terminal() {
        let cancel = CancellationToken::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let factory = FlakyFactory {
            failures: usize::MAX,
            opened: 0,
            stop_after: usize::MAX,
            cancel: cancel.clone(),
        };

        let mut supervisor = supervisor(factory, Arc::clone(&notifier))
            .with_backoff(Duration::from_secs(3600));

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let report = supervisor.run(&cancel).await;

        assert_eq!(report.failures, 1);
        assert_eq!(supervisor.state(), SupervisorState::Terminal);
        assert_eq!(notifier.messages().last().unwrap(), "End AutoUnlock");
    }

    #[tokio::test]
    async fn test_notifications_quote_last_log_line() {
        let last = LastLogLine::new(utc_offset(0).unwrap());
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(last.clone()));

        let cancel = CancellationToken::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let factory = FlakyFactory {
            failures: 1,
            opened: 0,
            stop_after: 1,
            cancel: cancel.clone(),
        };

        let mut supervisor = supervisor(factory, Arc::clone(&notifier)).with_last_log(last);
        supervisor.run(&cancel).await;

        let messages = notifier.messages();
        assert!(messages[0].contains(" : INFO : "));
        assert!(messages[0].ends_with("- Start AutoUnlock"));
        assert!(messages[1].contains(" : WARN : "));
        assert!(messages[1].contains("Restart AutoUnlock"));
        assert!(messages[2].ends_with("- End AutoUnlock"));
    }
}
