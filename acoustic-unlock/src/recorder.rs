//! Confirmation clip recording
//!
//! Pulls a fixed number of blocks straight from the sample source (detection
//! is paused meanwhile), then writes them as a 16-bit PCM WAV file to a fixed
//! path, replacing the previous clip.

use crate::analyzer::{AudioBlock, AudioSample};
use crate::config::UnlockConfig;
use crate::source::{SampleSource, SourceError};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const BITS_PER_SAMPLE: u16 = 16;

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Failed to create output directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write WAV file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },
}

/// Ordered run of blocks captured during one recording window
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    channels: u16,
    sample_rate: u32,
    samples: Vec<AudioSample>,
}

impl Clip {
    pub fn new(channels: u16, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
            samples: Vec::new(),
        }
    }

    pub fn push(&mut self, block: AudioBlock) {
        self.samples.extend(block.into_samples());
    }

    pub fn samples(&self) -> &[AudioSample] {
        &self.samples
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of multi-channel frames
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration_secs(&self) -> f32 {
        self.frame_count() as f32 / self.sample_rate as f32
    }

    pub fn spec(&self) -> WavSpec {
        WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: BITS_PER_SAMPLE,
            sample_format: SampleFormat::Int,
        }
    }

    /// Serialize as little-endian 16-bit PCM WAV, creating parent directories
    /// and overwriting any existing file
    pub fn write_wav(&self, path: &Path) -> Result<(), RecordingError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| RecordingError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let write_err = |source| RecordingError::Write {
            path: path.to_path_buf(),
            source,
        };

        let mut writer = WavWriter::create(path, self.spec()).map_err(write_err)?;
        for &sample in &self.samples {
            writer.write_sample(sample).map_err(write_err)?;
        }
        writer.finalize().map_err(write_err)?;

        Ok(())
    }
}

/// Records confirmation clips from the detector's own sample source
#[derive(Debug, Clone)]
pub struct ClipRecorder {
    blocks_to_record: usize,
    samples_per_block: usize,
    block_duration: Duration,
    channels: u16,
    sample_rate: u32,
    output_path: PathBuf,
}

impl ClipRecorder {
    pub fn from_config(config: &UnlockConfig) -> Self {
        Self {
            blocks_to_record: config.recording_blocks(),
            samples_per_block: config.samples_per_block(),
            block_duration: config.block_duration(),
            channels: config.channels,
            sample_rate: config.sample_rate,
            output_path: config.output_path.clone(),
        }
    }

    /// Read the configured number of blocks, paced at the device block rate
    ///
    /// Malformed blocks are skipped so the clip always holds whole frames.
    pub async fn record<S>(&self, source: &mut S) -> Result<Clip, SourceError>
    where
        S: SampleSource + ?Sized,
    {
        info!("Start recording {} blocks", self.blocks_to_record);

        let mut clip = Clip::new(self.channels, self.sample_rate);
        let mut pacer = tokio::time::interval(self.block_duration);
        pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for _ in 0..self.blocks_to_record {
            pacer.tick().await;

            let block = source.read_block().await?;
            if block.len() != self.samples_per_block {
                warn!(
                    "Skipping malformed block during recording: expected {} samples, got {}",
                    self.samples_per_block,
                    block.len()
                );
                continue;
            }
            clip.push(block);
        }

        debug!("Recorded {:.2}s of audio", clip.duration_secs());
        Ok(clip)
    }

    /// Write the clip to the output path and return that path
    pub fn save(&self, clip: &Clip) -> Result<PathBuf, RecordingError> {
        clip.write_wav(&self.output_path)?;
        info!("End recording to file: {}", self.output_path.display());
        Ok(self.output_path.clone())
    }

    pub fn blocks_to_record(&self) -> usize {
        self.blocks_to_record
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}
