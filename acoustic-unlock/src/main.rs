//! Acoustic unlock service binary
//!
//! Listens on the default input device and unlocks the configured device
//! once a phrase is authorized. Runs until interrupted.

use acoustic_unlock::{
    logging, CpalSourceFactory, HttpVerificationClient, LogFile, LogNotifier, Notifier,
    SlackNotifier, Supervisor, SwitchBotActuator, UnlockConfig,
};
use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config = match UnlockConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("Acoustic unlock service failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: UnlockConfig) -> anyhow::Result<()> {
    let log_file = LogFile::from_config(&config);
    let log_handle = logging::init(
        &config.logging_level,
        config.log_utc_offset_hours,
        log_file.as_ref(),
    )
    .context("initializing logging")?;

    info!("Starting acoustic unlock service");
    info!(
        "Audio: {} Hz, {} channel(s), {} frames per block, threshold {}",
        config.sample_rate, config.channels, config.block_size, config.threshold
    );

    let verifier = HttpVerificationClient::new(&config.verification_url, config.http_timeout())
        .context("building verification client")?;

    let actuator = SwitchBotActuator::new(
        &config.switch_bot_token,
        &config.switch_bot_secret,
        config.http_timeout(),
    )
    .context("building unlock actuator")?;

    let notifier: Arc<dyn Notifier> = match (&config.slack_token, &config.slack_channel) {
        (Some(token), Some(channel)) => Arc::new(
            SlackNotifier::new(token, channel, config.http_timeout())
                .context("building Slack notifier")?,
        ),
        _ => {
            warn!("Slack is not configured, notifications go to the log only");
            Arc::new(LogNotifier)
        }
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, shutting down");
                interrupt.cancel();
            }
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
    });

    let mut supervisor = Supervisor::new(
        config,
        CpalSourceFactory,
        Arc::new(verifier),
        Arc::new(actuator),
        notifier,
    )
    .with_last_log(log_handle.last_line());

    let report = supervisor.run(&cancel).await;
    info!(
        "Acoustic unlock service stopped after {} instance(s), {} failure(s)",
        report.instances, report.failures
    );

    Ok(())
}
