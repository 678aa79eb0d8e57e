//! Amplitude frame analysis
//!
//! Computes the peak normalized amplitude of a block of 16-bit PCM and
//! classifies it against the loudness threshold.

use crate::config::UnlockConfig;
use thiserror::Error;
use tracing::trace;

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Magnitude of `i16::MIN`, used as the normalization divisor
const FULL_SCALE: f32 = 32768.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerError {
    #[error("Invalid block: expected {expected} samples, got {actual}")]
    InvalidBlock { expected: usize, actual: usize },
}

/// One fixed-size chunk of interleaved samples read from the input device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlock {
    samples: Vec<AudioSample>,
}

impl AudioBlock {
    pub fn new(samples: Vec<AudioSample>) -> Self {
        Self { samples }
    }

    /// Block filled with a single sample value
    pub fn filled(value: AudioSample, len: usize) -> Self {
        Self::new(vec![value; len])
    }

    pub fn samples(&self) -> &[AudioSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<AudioSample> {
        self.samples
    }
}

impl From<Vec<AudioSample>> for AudioBlock {
    fn from(samples: Vec<AudioSample>) -> Self {
        Self::new(samples)
    }
}

/// Peak of `|sample| / 32768` over the slice, in `[0.0, 1.0]`
pub fn peak_amplitude(samples: &[AudioSample]) -> f32 {
    let peak = samples
        .iter()
        .map(|s| s.unsigned_abs())
        .max()
        .unwrap_or(0);

    peak as f32 / FULL_SCALE
}

/// Result of analysing one block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameAnalysis {
    pub amplitude: f32,
    pub above_threshold: bool,
}

/// Stateless per-block loudness classifier
#[derive(Debug, Clone)]
pub struct FrameAnalyzer {
    samples_per_block: usize,
    threshold: f32,
}

impl FrameAnalyzer {
    pub fn new(samples_per_block: usize, threshold: f32) -> Self {
        Self {
            samples_per_block,
            threshold,
        }
    }

    pub fn from_config(config: &UnlockConfig) -> Self {
        Self::new(config.samples_per_block(), config.threshold)
    }

    /// Analyse a block, rejecting blocks whose length differs from the configured size
    pub fn analyze(&self, block: &AudioBlock) -> Result<FrameAnalysis, AnalyzerError> {
        if block.len() != self.samples_per_block {
            return Err(AnalyzerError::InvalidBlock {
                expected: self.samples_per_block,
                actual: block.len(),
            });
        }

        let amplitude = peak_amplitude(block.samples());
        let above_threshold = amplitude > self.threshold;

        trace!(
            "Block analysis: amplitude={:.4}, above_threshold={}",
            amplitude, above_threshold
        );

        Ok(FrameAnalysis {
            amplitude,
            above_threshold,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn samples_per_block(&self) -> usize {
        self.samples_per_block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn generate_tone(frequency: f32, len: usize, amplitude: f32) -> Vec<AudioSample> {
        let sample_rate = 16000.0;
        (0..len)
            .map(|i| {
                let t = i as f32 / sample_rate;
                let sample = amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin();
                (sample * i16::MAX as f32) as i16
            })
            .collect()
    }

    #[test]
    fn test_silence_has_zero_amplitude() {
        assert_relative_eq!(peak_amplitude(&[0; 480]), 0.0);
        assert_relative_eq!(peak_amplitude(&[]), 0.0);
    }

    #[test]
    fn test_peak_uses_absolute_value() {
        let samples = vec![100, -16384, 200];
        assert_relative_eq!(peak_amplitude(&samples), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_full_scale_negative_is_one() {
        assert_relative_eq!(peak_amplitude(&[i16::MIN]), 1.0);
        assert!(peak_amplitude(&[i16::MAX]) < 1.0);
    }

    #[test]
    fn test_tone_peak_tracks_amplitude() {
        let tone = generate_tone(200.0, 1600, 0.3);
        assert_relative_eq!(peak_amplitude(&tone), 0.3, epsilon = 0.01);
    }

    #[test]
    fn test_threshold_is_strict() {
        let analyzer = FrameAnalyzer::new(4, 0.5);

        let at_threshold = AudioBlock::new(vec![16384, 0, 0, 0]);
        let analysis = analyzer.analyze(&at_threshold).unwrap();
        assert!(!analysis.above_threshold);

        let above = AudioBlock::new(vec![16385, 0, 0, 0]);
        assert!(analyzer.analyze(&above).unwrap().above_threshold);
    }

    #[test]
    fn test_short_block_is_invalid() {
        let analyzer = FrameAnalyzer::new(480, 0.5);
        let result = analyzer.analyze(&AudioBlock::filled(0, 100));

        match result {
            Err(AnalyzerError::InvalidBlock { expected, actual }) => {
                assert_eq!(expected, 480);
                assert_eq!(actual, 100);
            }
            _ => panic!("Expected InvalidBlock error"),
        }
    }

    #[test]
    fn test_from_config_uses_interleaved_length() {
        let mut config = crate::config::test_config();
        config.channels = 2;

        let analyzer = FrameAnalyzer::from_config(&config);
        assert_eq!(analyzer.samples_per_block(), config.block_size * 2);
        assert_relative_eq!(analyzer.threshold(), config.threshold);
    }
}
