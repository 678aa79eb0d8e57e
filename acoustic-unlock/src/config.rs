//! Service configuration
//!
//! Loaded once at startup from the process environment (a `.env` file is
//! honoured when present) and immutable afterwards. Frame thresholds are
//! derived from the second-based settings and the block rate.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value:?}")]
    Parse { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the acoustic unlock service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockConfig {
    /// Capture sample rate (Hz)
    pub sample_rate: u32,

    /// Frames per block read from the input device
    pub block_size: usize,

    /// Interleaved channel count
    pub channels: u16,

    /// Peak amplitude threshold (normalized, 0.0 - 1.0)
    pub threshold: f32,

    /// Contiguous loud blocks required before a candidate event
    pub consecutive_frames_threshold: u32,

    /// Blocks required between two candidate events
    pub interval_frames_threshold: u32,

    /// Length of the confirmation clip (seconds)
    pub recording_duration_secs: f32,

    /// Phrase verification endpoint
    pub verification_url: String,

    /// Device that receives the unlock command
    pub unlock_device_id: String,

    pub switch_bot_token: String,
    pub switch_bot_secret: String,

    /// Slack credentials; notifications only go to the log without them
    pub slack_token: Option<String>,
    pub slack_channel: Option<String>,

    /// Where the confirmation clip is written (overwritten every attempt)
    pub output_path: PathBuf,

    pub restart_backoff_secs: u64,

    /// Maximum wait for a block before the device is considered gone
    pub device_timeout_secs: u64,

    pub http_timeout_secs: u64,

    pub logging_level: String,

    /// Offset applied to log timestamps
    pub log_utc_offset_hours: i32,

    /// Rotating log file; `None` logs to stdout only
    pub log_file_path: Option<PathBuf>,

    /// Rotated files kept next to the active one
    pub log_backup_count: usize,

    /// Size at which the log file is rotated (GiB)
    pub log_file_size_gb: f64,
}

impl Default for UnlockConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            block_size: 1024,
            channels: 1,
            threshold: 0.5,
            consecutive_frames_threshold: 4,  // ~0.25s at 16kHz / 1024
            interval_frames_threshold: 79,    // ~5s
            recording_duration_secs: 3.0,
            verification_url: String::new(), // Must be provided by user
            unlock_device_id: String::new(),
            switch_bot_token: String::new(),
            switch_bot_secret: String::new(),
            slack_token: None,
            slack_channel: None,
            output_path: PathBuf::from("out/record.wav"),
            restart_backoff_secs: 10,
            device_timeout_secs: 5,
            http_timeout_secs: 30,
            logging_level: "info".to_string(),
            log_utc_offset_hours: 9,
            log_file_path: Some(PathBuf::from("log/application.log")),
            log_backup_count: 5,
            log_file_size_gb: 1.0,
        }
    }
}

impl UnlockConfig {
    /// Load configuration from the environment, reading `.env` first if present
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenv::dotenv() {
            debug!("No .env file loaded: {}", e);
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let sample_rate = parse_or(&lookup, "AUDIO_RATE", defaults.sample_rate)?;
        let block_size = parse_or(&lookup, "AUDIO_CHUNK", defaults.block_size)?;
        let consecutive_secs: f32 = parse_or(&lookup, "CONSECUTIVE_SEC_THRESHOLD", 0.2)?;
        let interval_secs: f32 = parse_or(&lookup, "INTERVAL_SEC_THRESHOLD", 5.0)?;

        if !is_positive(consecutive_secs) || !is_positive(interval_secs) {
            return Err(ConfigError::Invalid(
                "CONSECUTIVE_SEC_THRESHOLD and INTERVAL_SEC_THRESHOLD must be positive and finite"
                    .to_string(),
            ));
        }

        let blocks_per_second = if block_size == 0 {
            0.0
        } else {
            sample_rate as f32 / block_size as f32
        };

        let slack_token = lookup("SLACK_API_TOKEN").filter(|v| !v.is_empty());
        let slack_channel = lookup("SLACK_CHANNEL").filter(|v| !v.is_empty());

        let config = Self {
            sample_rate,
            block_size,
            channels: parse_or(&lookup, "AUDIO_CHANNELS", defaults.channels)?,
            threshold: parse_or(&lookup, "AUDIO_THRESHOLD", defaults.threshold)?,
            consecutive_frames_threshold: seconds_to_blocks(consecutive_secs, blocks_per_second),
            interval_frames_threshold: seconds_to_blocks(interval_secs, blocks_per_second),
            recording_duration_secs: parse_or(
                &lookup,
                "RECORDING_DURATION_SEC",
                defaults.recording_duration_secs,
            )?,
            verification_url: required(&lookup, "AUTO_UNLOCK_API_URL")?,
            unlock_device_id: required(&lookup, "UNLOCK_BOT_ID")?,
            switch_bot_token: required(&lookup, "SWITCH_BOT_TOKEN")?,
            switch_bot_secret: required(&lookup, "SWITCH_BOT_SECRET")?,
            slack_token,
            slack_channel,
            output_path: lookup("RECORDING_OUTPUT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            restart_backoff_secs: parse_or(
                &lookup,
                "RESTART_BACKOFF_SEC",
                defaults.restart_backoff_secs,
            )?,
            device_timeout_secs: parse_or(
                &lookup,
                "DEVICE_TIMEOUT_SEC",
                defaults.device_timeout_secs,
            )?,
            http_timeout_secs: parse_or(&lookup, "HTTP_TIMEOUT_SEC", defaults.http_timeout_secs)?,
            logging_level: lookup("LOGGING_LEVEL").unwrap_or(defaults.logging_level),
            log_utc_offset_hours: parse_or(
                &lookup,
                "LOG_UTC_OFFSET_HOURS",
                defaults.log_utc_offset_hours,
            )?,
            log_file_path: match lookup("LOG_FILE_PATH") {
                Some(path) if path.is_empty() => None,
                Some(path) => Some(PathBuf::from(path)),
                None => defaults.log_file_path,
            },
            log_backup_count: parse_or(
                &lookup,
                "LOGGING_BACKUP_COUNT",
                defaults.log_backup_count,
            )?,
            log_file_size_gb: parse_or(&lookup, "LOGFILE_SIZE_GB", defaults.log_file_size_gb)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 || self.block_size == 0 || self.channels == 0 {
            return Err(ConfigError::Invalid(
                "sample_rate, block_size and channels must be greater than 0".to_string(),
            ));
        }

        if self.blocks_per_second() <= 0.0 {
            return Err(ConfigError::Invalid(
                "sample_rate / block_size must be positive".to_string(),
            ));
        }

        if !(self.threshold.is_finite() && self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(ConfigError::Invalid(
                "threshold must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.consecutive_frames_threshold == 0 || self.interval_frames_threshold == 0 {
            return Err(ConfigError::Invalid(
                "frame thresholds must be greater than 0".to_string(),
            ));
        }

        if !is_positive(self.recording_duration_secs) {
            return Err(ConfigError::Invalid(
                "recording_duration_secs must be positive and finite".to_string(),
            ));
        }

        if self.verification_url.is_empty() {
            return Err(ConfigError::Invalid(
                "verification_url is required".to_string(),
            ));
        }

        if self.unlock_device_id.is_empty() {
            return Err(ConfigError::Invalid(
                "unlock_device_id is required".to_string(),
            ));
        }

        if !(-12..=14).contains(&self.log_utc_offset_hours) {
            return Err(ConfigError::Invalid(format!(
                "log_utc_offset_hours out of range: {}",
                self.log_utc_offset_hours
            )));
        }

        if self.log_file_path.is_some() {
            if self.log_backup_count == 0 {
                return Err(ConfigError::Invalid(
                    "log_backup_count must be greater than 0".to_string(),
                ));
            }

            if !(self.log_file_size_gb.is_finite() && self.log_file_size_gb > 0.0) {
                return Err(ConfigError::Invalid(
                    "log_file_size_gb must be positive and finite".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Blocks delivered per second of audio
    pub fn blocks_per_second(&self) -> f32 {
        self.sample_rate as f32 / self.block_size as f32
    }

    /// Interleaved samples in one block
    pub fn samples_per_block(&self) -> usize {
        self.block_size * self.channels as usize
    }

    /// Wall-clock duration of one block
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }

    /// Number of blocks making up one confirmation clip
    pub fn recording_blocks(&self) -> usize {
        let blocks = self.sample_rate as f64 * self.recording_duration_secs as f64
            / self.block_size as f64;
        ceil_tolerant(blocks) as usize
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_secs)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Log file size that triggers rotation, never below one byte
    pub fn log_file_max_bytes(&self) -> u64 {
        ((self.log_file_size_gb * 1024.0 * 1024.0 * 1024.0) as u64).max(1)
    }
}

fn is_positive(value: f32) -> bool {
    value.is_finite() && value > 0.0
}

fn seconds_to_blocks(seconds: f32, blocks_per_second: f32) -> u32 {
    (ceil_tolerant(seconds as f64 * blocks_per_second as f64) as u32).max(1)
}

/// Ceiling that ignores float noise from decimal second values (0.3 * 10 is 3, not 4)
fn ceil_tolerant(value: f64) -> f64 {
    (value - 1e-4).ceil().max(0.0)
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parse_or<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Parse { name, value: raw }),
        None => Ok(default),
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> UnlockConfig {
    UnlockConfig {
        sample_rate: 8000,
        block_size: 800,
        channels: 1,
        threshold: 0.5,
        consecutive_frames_threshold: 3,
        interval_frames_threshold: 5,
        recording_duration_secs: 0.3,
        verification_url: "http://127.0.0.1:9/verify".to_string(),
        unlock_device_id: "lock-01".to_string(),
        switch_bot_token: "token".to_string(),
        switch_bot_secret: "secret".to_string(),
        device_timeout_secs: 1,
        log_file_path: None,
        ..Default::default()
    }
}
