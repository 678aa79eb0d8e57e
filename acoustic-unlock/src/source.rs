//! Sample sources
//!
//! A [`SampleSource`] hands out fixed-size blocks of interleaved i16 samples
//! and is owned by exactly one detector instance. The cpal implementation
//! runs the device stream on its own thread (cpal streams cannot cross
//! threads on every platform) and feeds a [`capture_channel`] ring.

use crate::analyzer::{AudioBlock, AudioSample};
use crate::capture_buffer::{capture_channel, CaptureReader, CaptureWriter, BUFFER_DURATION_SECS};
use crate::config::UnlockConfig;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("No input device available")]
    NoDevice,

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Unsupported stream configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Sample source is closed")]
    Closed,
}

/// Blocking pull interface over a live input
#[async_trait]
pub trait SampleSource: Send {
    /// Wait for the next full block
    async fn read_block(&mut self) -> Result<AudioBlock, SourceError>;

    /// Drop everything captured but not yet read. Returns the number of
    /// samples discarded.
    fn discard_pending(&mut self) -> usize;

    /// Release the device. Calling it again is a no-op. An error reports a
    /// teardown problem; the device counts as released either way.
    fn close(&mut self) -> Result<(), SourceError>;
}

/// Opens a fresh source for every detector instance
pub trait SourceFactory: Send {
    type Source: SampleSource + 'static;

    fn open(&mut self, config: &UnlockConfig) -> Result<Self::Source, SourceError>;
}

/// Opens the default cpal input device
#[derive(Debug, Default, Clone)]
pub struct CpalSourceFactory;

impl SourceFactory for CpalSourceFactory {
    type Source = CpalSource;

    fn open(&mut self, config: &UnlockConfig) -> Result<CpalSource, SourceError> {
        CpalSource::open(config)
    }
}

/// Failure reported by the stream error callback
type FailureSlot = Arc<Mutex<Option<String>>>;

/// Live microphone input backed by cpal
pub struct CpalSource {
    reader: CaptureReader,
    samples_per_block: usize,
    poll_interval: Duration,
    device_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    failure: FailureSlot,
    worker: Option<JoinHandle<()>>,
}

impl CpalSource {
    /// Open the default input device and start capturing
    pub fn open(config: &UnlockConfig) -> Result<Self, SourceError> {
        let samples_per_block = config.samples_per_block();
        let capacity = (config.sample_rate as usize * config.channels as usize * BUFFER_DURATION_SECS)
            .max(samples_per_block * 4);
        let (writer, reader) = capture_channel(capacity);

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let failure: FailureSlot = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker = {
            let shutdown = Arc::clone(&shutdown);
            let failure = Arc::clone(&failure);

            thread::Builder::new()
                .name("audio-capture".to_string())
                .spawn(move || capture_thread(stream_config, writer, shutdown, failure, ready_tx))
                .map_err(|e| SourceError::DeviceUnavailable(e.to_string()))?
        };

        let worker = await_ready(&ready_rx, worker, &shutdown, config.device_timeout())?;

        info!(
            "Audio input opened: {} Hz, {} channel(s), {} frames per block",
            config.sample_rate, config.channels, config.block_size
        );

        Ok(Self {
            reader,
            samples_per_block,
            poll_interval: (config.block_duration() / 4).max(Duration::from_millis(1)),
            device_timeout: config.device_timeout(),
            shutdown,
            failure,
            worker: Some(worker),
        })
    }

    fn take_failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Samples lost because the detector fell behind the device
    pub fn dropped_samples(&self) -> u64 {
        self.reader.dropped_samples()
    }
}

#[async_trait]
impl SampleSource for CpalSource {
    async fn read_block(&mut self) -> Result<AudioBlock, SourceError> {
        let deadline = Instant::now() + self.device_timeout;

        loop {
            if self.worker.is_none() {
                return Err(SourceError::Closed);
            }

            if let Some(reason) = self.take_failure() {
                return Err(SourceError::DeviceUnavailable(reason));
            }

            if self.reader.len() >= self.samples_per_block {
                let samples = self
                    .reader
                    .read(self.samples_per_block)
                    .map_err(|e| SourceError::DeviceUnavailable(e.to_string()))?;
                return Ok(AudioBlock::new(samples));
            }

            if Instant::now() >= deadline {
                return Err(SourceError::DeviceUnavailable(format!(
                    "no audio received within {:?}",
                    self.device_timeout
                )));
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn discard_pending(&mut self) -> usize {
        let pending = self.reader.len();
        self.reader.clear();
        pending
    }

    fn close(&mut self) -> Result<(), SourceError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        self.shutdown.store(true, Ordering::Release);
        worker.thread().unpark();

        let dropped = self.reader.dropped_samples();
        if dropped > 0 {
            warn!("{} samples dropped by capture overruns", dropped);
        }

        worker
            .join()
            .map_err(|_| SourceError::DeviceUnavailable("capture thread panicked".to_string()))?;

        info!("Audio input released");
        Ok(())
    }
}

/// Wait for the capture thread to report that the stream is playing
///
/// A thread that stays silent past `timeout` is told to shut down and left
/// detached; joining it could hang on a wedged driver.
fn await_ready(
    ready: &Receiver<Result<(), SourceError>>,
    worker: JoinHandle<()>,
    shutdown: &AtomicBool,
    timeout: Duration,
) -> Result<JoinHandle<()>, SourceError> {
    match ready.recv_timeout(timeout) {
        Ok(Ok(())) => Ok(worker),
        Ok(Err(e)) => {
            let _ = worker.join();
            Err(e)
        }
        Err(RecvTimeoutError::Timeout) => {
            shutdown.store(true, Ordering::Release);
            worker.thread().unpark();
            warn!("Audio input did not start within {:?}", timeout);
            Err(SourceError::DeviceUnavailable(format!(
                "device did not start within {:?}",
                timeout
            )))
        }
        Err(RecvTimeoutError::Disconnected) => {
            let _ = worker.join();
            Err(SourceError::DeviceUnavailable(
                "capture thread exited during startup".to_string(),
            ))
        }
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.close() {
                error!("Failed to release audio input: {}", e);
            }
        }
    }
}

/// Owns the cpal stream for its whole life; exits when `shutdown` is set
fn capture_thread(
    stream_config: StreamConfig,
    writer: CaptureWriter,
    shutdown: Arc<AtomicBool>,
    failure: FailureSlot,
    ready: mpsc::Sender<Result<(), SourceError>>,
) {
    let stream = match build_input_stream(&stream_config, writer, Arc::clone(&failure)) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(SourceError::DeviceUnavailable(e.to_string())));
        return;
    }

    let _ = ready.send(Ok(()));

    while !shutdown.load(Ordering::Acquire) {
        thread::park_timeout(Duration::from_millis(100));
    }

    drop(stream);
    debug!("Capture thread exiting");
}

fn build_input_stream(
    stream_config: &StreamConfig,
    mut writer: CaptureWriter,
    failure: FailureSlot,
) -> Result<cpal::Stream, SourceError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(SourceError::NoDevice)?;

    let device_name = device.name().unwrap_or_else(|_| "Unknown Device".to_string());
    let sample_format = device
        .default_input_config()
        .map_err(|e| SourceError::DeviceUnavailable(e.to_string()))?
        .sample_format();

    debug!("Using input device '{}' ({:?})", device_name, sample_format);

    let on_error = move |err: cpal::StreamError| {
        error!("Audio stream error: {}", err);
        *failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err.to_string());
    };

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            stream_config,
            move |data: &[AudioSample], _: &cpal::InputCallbackInfo| {
                writer.write(data);
            },
            on_error,
            None,
        ),
        SampleFormat::F32 => device.build_input_stream(
            stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                writer.write_iter(data.iter().map(|&s| AudioSample::from_sample(s)));
            },
            on_error,
            None,
        ),
        other => {
            return Err(SourceError::UnsupportedConfig(format!(
                "sample format {:?}",
                other
            )))
        }
    };

    stream.map_err(|e| SourceError::UnsupportedConfig(e.to_string()))
}

/// In-memory source replaying a fixed list of blocks, then failing as if unplugged
///
/// Blocks pushed into `pending` stand in for audio that piled up while the
/// detector was busy. They are served before the script and dropped by
/// `discard_pending`.
#[cfg(test)]
pub(crate) struct ScriptedSource {
    pub blocks: std::collections::VecDeque<AudioBlock>,
    pub pending: Arc<Mutex<std::collections::VecDeque<AudioBlock>>>,
    pub discarded: usize,
    pub reads: usize,
    pub closes: usize,
}

#[cfg(test)]
impl ScriptedSource {
    pub fn new(blocks: Vec<AudioBlock>) -> Self {
        Self {
            blocks: blocks.into(),
            pending: Arc::default(),
            discarded: 0,
            reads: 0,
            closes: 0,
        }
    }
}

#[cfg(test)]
#[async_trait]
impl SampleSource for ScriptedSource {
    async fn read_block(&mut self) -> Result<AudioBlock, SourceError> {
        self.reads += 1;
        if let Some(block) = self.pending.lock().unwrap().pop_front() {
            return Ok(block);
        }
        self.blocks
            .pop_front()
            .ok_or_else(|| SourceError::DeviceUnavailable("script exhausted".to_string()))
    }

    fn discard_pending(&mut self) -> usize {
        let mut pending = self.pending.lock().unwrap();
        let samples = pending.iter().map(AudioBlock::len).sum();
        self.discarded += pending.len();
        pending.clear();
        samples
    }

    fn close(&mut self) -> Result<(), SourceError> {
        self.closes += 1;
        Ok(())
    }
}
