//! Capture ring buffer
//!
//! Single-producer/single-consumer ring between the audio device callback
//! and the detector. The writer half lives in the real-time callback and never
//! blocks or allocates; when the reader falls behind, the newest samples are
//! dropped and counted as overruns.

use cache_padded::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::analyzer::AudioSample;

/// Seconds of audio the ring holds before overrunning
pub const BUFFER_DURATION_SECS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Buffer underflow: attempted to read {0} samples, but only {1} available")]
    Underflow(usize, usize),
}

type RingBuffer = HeapRb<AudioSample>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

/// Counters shared between both halves, padded to avoid false sharing
#[derive(Default)]
struct CaptureCounters {
    written: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
}

/// Producer half, owned by the device callback
pub struct CaptureWriter {
    producer: RingProducer,
    counters: Arc<CaptureCounters>,
}

/// Consumer half, owned by the sample source
pub struct CaptureReader {
    consumer: RingConsumer,
    counters: Arc<CaptureCounters>,
}

/// Create a ring holding `capacity` samples
pub fn capture_channel(capacity: usize) -> (CaptureWriter, CaptureReader) {
    debug!("Creating capture buffer with capacity: {} samples", capacity);

    let (producer, consumer) = RingBuffer::new(capacity).split();
    let counters = Arc::new(CaptureCounters::default());

    (
        CaptureWriter {
            producer,
            counters: Arc::clone(&counters),
        },
        CaptureReader { consumer, counters },
    )
}

impl CaptureWriter {
    /// Push samples, dropping whatever does not fit. Returns samples accepted.
    pub fn write(&mut self, samples: &[AudioSample]) -> usize {
        let written = self.producer.push_slice(samples);
        self.account(samples.len(), written);
        written
    }

    /// Push converted samples from an iterator, dropping what does not fit
    pub fn write_iter<I>(&mut self, samples: I) -> usize
    where
        I: ExactSizeIterator<Item = AudioSample>,
    {
        let offered = samples.len();
        let written = self.producer.push_iter(samples);
        self.account(offered, written);
        written
    }

    fn account(&self, offered: usize, written: usize) {
        self.counters
            .written
            .fetch_add(written as u64, Ordering::Relaxed);
        if written < offered {
            self.counters
                .dropped
                .fetch_add((offered - written) as u64, Ordering::Relaxed);
        }
    }

    pub fn free_space(&self) -> usize {
        self.producer.vacant_len()
    }
}

impl CaptureReader {
    /// Remove exactly `count` samples from the ring
    pub fn read(&mut self, count: usize) -> Result<Vec<AudioSample>, CaptureError> {
        let available = self.consumer.occupied_len();

        if count > available {
            return Err(CaptureError::Underflow(count, available));
        }

        let mut result = vec![0; count];
        let read = self.consumer.pop_slice(&mut result);
        result.truncate(read);

        Ok(result)
    }

    /// Samples ready to be read
    pub fn len(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.consumer.capacity().get()
    }

    /// Discard everything currently buffered
    pub fn clear(&mut self) {
        let occupied = self.consumer.occupied_len();
        self.consumer.skip(occupied);
        debug!("Cleared capture buffer");
    }

    /// Total samples accepted from the device
    pub fn written_samples(&self) -> u64 {
        self.counters.written.load(Ordering::Relaxed)
    }

    /// Total samples lost to overruns
    pub fn dropped_samples(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_creation() {
        let (writer, reader) = capture_channel(1000);
        assert_eq!(reader.capacity(), 1000);
        assert_eq!(writer.free_space(), 1000);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_write_and_read() {
        let (mut writer, mut reader) = capture_channel(1000);
        let samples: Vec<i16> = (0..100).map(|i| i as i16).collect();

        assert_eq!(writer.write(&samples), 100);
        assert_eq!(reader.len(), 100);

        let read = reader.read(50).unwrap();
        assert_eq!(read.len(), 50);
        assert_eq!(read[0], 0);
        assert_eq!(read[49], 49);
        assert_eq!(reader.len(), 50);
    }

    #[test]
    fn test_overrun_drops_newest_samples() {
        let (mut writer, mut reader) = capture_channel(100);

        writer.write(&vec![1; 80]);
        let written = writer.write(&vec![2; 50]);

        assert_eq!(written, 20);
        assert_eq!(reader.len(), 100);
        assert_eq!(reader.dropped_samples(), 30);
        assert_eq!(reader.written_samples(), 100);

        // Oldest data is preserved
        let data = reader.read(100).unwrap();
        assert_eq!(data[0], 1);
        assert_eq!(data[99], 2);
    }

    #[test]
    fn test_buffer_underflow() {
        let (mut writer, mut reader) = capture_channel(100);
        writer.write(&vec![1; 50]);

        match reader.read(100) {
            Err(CaptureError::Underflow(requested, available)) => {
                assert_eq!(requested, 100);
                assert_eq!(available, 50);
            }
            _ => panic!("Expected Underflow error"),
        }

        // Nothing was consumed by the failed read
        assert_eq!(reader.len(), 50);
    }

    #[test]
    fn test_write_iter_converts() {
        let (mut writer, mut reader) = capture_channel(10);
        let floats = [0.0f32, 0.5, -0.5];

        let written = writer.write_iter(floats.iter().map(|&f| (f * 100.0) as i16));
        assert_eq!(written, 3);
        assert_eq!(reader.read(3).unwrap(), vec![0, 50, -50]);
    }

    #[test]
    fn test_clear() {
        let (mut writer, mut reader) = capture_channel(1000);
        writer.write(&vec![1; 500]);

        reader.clear();
        assert!(reader.is_empty());
        assert_eq!(writer.free_space(), 1000);
    }

    #[test]
    fn test_clear_after_overrun_resumes_with_fresh_audio() {
        let (mut writer, mut reader) = capture_channel(40);

        for block in 1..=6 {
            writer.write(&[block; 10]);
        }
        assert_eq!(reader.dropped_samples(), 20);

        reader.clear();
        writer.write(&[7; 10]);

        assert_eq!(reader.len(), 10);
        assert_eq!(reader.read(10).unwrap(), vec![7; 10]);
    }

    #[test]
    fn test_halves_work_across_threads() {
        let (mut writer, mut reader) = capture_channel(4096);

        let handle = std::thread::spawn(move || {
            for _ in 0..10 {
                writer.write(&[7; 100]);
            }
        });
        handle.join().unwrap();

        assert_eq!(reader.read(1000).unwrap().len(), 1000);
        assert_eq!(reader.dropped_samples(), 0);
    }
}
