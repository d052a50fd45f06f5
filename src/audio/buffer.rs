//! Lock-free sample buffering for audio
//!
//! The jitter buffer decouples bursty network arrival from the fixed-period
//! output callback. Storage is a fixed-capacity ring addressed by atomic
//! read/write indices (`crossbeam::queue::ArrayQueue`), so the real-time
//! consumer never waits on a lock held by the producer.

use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::codec::pcm;
use crate::config::PcmEndian;
use crate::error::CodecError;

/// A block of captured mono samples
#[derive(Clone, Debug)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    /// Capture time in microseconds since capture start
    pub timestamp: u64,
    /// Block sequence number
    pub sequence: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, timestamp: u64, sequence: u32) -> Self {
        Self {
            samples,
            timestamp,
            sequence,
        }
    }

    /// Block duration in microseconds
    pub fn duration_us(&self, sample_rate: u32) -> u64 {
        (self.samples.len() as u64 * 1_000_000) / sample_rate as u64
    }
}

/// Fixed-capacity ring of mono samples.
///
/// Pushing into a full ring evicts the oldest sample.
pub struct SampleRing {
    queue: ArrayQueue<f32>,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Append a sample, returning true if an old sample was evicted
    #[inline]
    pub fn push_evicting(&self, sample: f32) -> bool {
        self.queue.force_push(sample).is_some()
    }

    /// Move up to `out.len()` samples into `out`, returning how many
    pub fn pop_into(&self, out: &mut [f32]) -> usize {
        let mut n = 0;
        for slot in out.iter_mut() {
            match self.queue.pop() {
                Some(sample) => {
                    *slot = sample;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Jitter buffer between the demultiplexer and the audio output device
pub struct JitterBuffer {
    ring: SampleRing,
    sample_rate: u32,
    endian: PcmEndian,
    /// Set at teardown; pulls return silence and pushes are ignored
    detached: AtomicBool,
    in_underrun: AtomicBool,
    samples_in: AtomicU64,
    samples_out: AtomicU64,
    silence_out: AtomicU64,
    underruns: AtomicU64,
    overrun_samples: AtomicU64,
    decode_errors: AtomicU64,
}

impl JitterBuffer {
    /// Create a buffer for one connection's audio.
    ///
    /// `high_water` is the most samples held at once; beyond it the oldest
    /// are dropped. A different sample rate needs a new buffer.
    pub fn new(sample_rate: u32, endian: PcmEndian, high_water: usize) -> Self {
        Self {
            ring: SampleRing::new(high_water),
            sample_rate,
            endian,
            detached: AtomicBool::new(false),
            in_underrun: AtomicBool::new(false),
            samples_in: AtomicU64::new(0),
            samples_out: AtomicU64::new(0),
            silence_out: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            overrun_samples: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Decode a PCM payload and append it.
    ///
    /// Returns the number of samples appended. A malformed payload is
    /// dropped whole.
    pub fn on_audio_payload(&self, bytes: &[u8]) -> Result<usize, CodecError> {
        if self.detached.load(Ordering::Acquire) {
            return Ok(0);
        }

        let samples = match pcm::decode_iter(bytes, self.endian) {
            Ok(samples) => samples,
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let mut appended = 0;
        let mut evicted = 0u64;
        for sample in samples {
            if self.ring.push_evicting(sample) {
                evicted += 1;
            }
            appended += 1;
        }

        self.samples_in.fetch_add(appended as u64, Ordering::Relaxed);
        if evicted > 0 {
            self.overrun_samples.fetch_add(evicted, Ordering::Relaxed);
            tracing::debug!(
                "Audio overrun: dropped {} oldest samples (high-water {})",
                evicted,
                self.ring.capacity()
            );
        }
        Ok(appended)
    }

    /// Fill `out` from the buffer, padding any shortfall with silence.
    ///
    /// Never blocks. Returns how many real samples were written; the rest of
    /// `out` is zero.
    pub fn pull_block(&self, out: &mut [f32]) -> usize {
        if self.detached.load(Ordering::Acquire) {
            out.fill(0.0);
            return 0;
        }

        let n = self.ring.pop_into(out);
        out[n..].fill(0.0);

        self.samples_out.fetch_add(n as u64, Ordering::Relaxed);
        if n < out.len() {
            self.silence_out
                .fetch_add((out.len() - n) as u64, Ordering::Relaxed);
            self.underruns.fetch_add(1, Ordering::Relaxed);
            // Log once per episode, not once per callback
            if !self.in_underrun.swap(true, Ordering::Relaxed) {
                tracing::debug!("Audio underrun: {} of {} samples available", n, out.len());
            }
        } else {
            self.in_underrun.store(false, Ordering::Relaxed);
        }
        n
    }

    /// Allocating form of [`pull_block`](Self::pull_block)
    pub fn pull_block_vec(&self, n: usize) -> Vec<f32> {
        let mut out = vec![0.0; n];
        self.pull_block(&mut out);
        out
    }

    /// Stop serving samples. Pulls return silence from now on.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Samples currently buffered
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    /// Buffered audio in milliseconds
    pub fn buffered_ms(&self) -> u64 {
        self.ring.len() as u64 * 1000 / self.sample_rate as u64
    }

    pub fn stats(&self) -> JitterStats {
        JitterStats {
            sample_rate: self.sample_rate,
            buffered: self.ring.len(),
            capacity: self.ring.capacity(),
            samples_in: self.samples_in.load(Ordering::Relaxed),
            samples_out: self.samples_out.load(Ordering::Relaxed),
            silence_out: self.silence_out.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            overrun_samples: self.overrun_samples.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Serialize)]
pub struct JitterStats {
    pub sample_rate: u32,
    pub buffered: usize,
    pub capacity: usize,
    pub samples_in: u64,
    pub samples_out: u64,
    pub silence_out: u64,
    pub underruns: u64,
    pub overrun_samples: u64,
    pub decode_errors: u64,
}

impl JitterStats {
    pub fn fill_level(&self) -> f32 {
        self.buffered as f32 / self.capacity as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Little-endian payload from raw codes; code / 32768 decodes exactly
    fn payload(codes: &[i16]) -> Vec<u8> {
        codes.iter().flat_map(|c| c.to_le_bytes()).collect()
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let ring = SampleRing::new(3);
        assert!(!ring.push_evicting(1.0));
        assert!(!ring.push_evicting(2.0));
        assert!(!ring.push_evicting(3.0));
        assert!(ring.push_evicting(4.0));

        let mut out = [0.0; 4];
        assert_eq!(ring.pop_into(&mut out), 3);
        assert_eq!(&out[..3], &[2.0, 3.0, 4.0]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_pull_full_block() {
        let jitter = JitterBuffer::new(16_000, PcmEndian::Little, 1024);
        jitter.on_audio_payload(&payload(&[16384, -16384, 8192, 0])).unwrap();

        assert_eq!(jitter.pull_block_vec(2), vec![0.5, -0.5]);
        assert_eq!(jitter.buffered(), 2);
        assert_eq!(jitter.stats().underruns, 0);
    }

    #[test]
    fn test_underrun_zero_fills() {
        let jitter = JitterBuffer::new(16_000, PcmEndian::Little, 1024);
        jitter.on_audio_payload(&payload(&[16384, 8192, -8192])).unwrap();

        let mut out = [9.0f32; 8];
        let real = jitter.pull_block(&mut out);
        assert_eq!(real, 3);
        assert_eq!(out, [0.5, 0.25, -0.25, 0.0, 0.0, 0.0, 0.0, 0.0]);

        let stats = jitter.stats();
        assert_eq!(stats.underruns, 1);
        assert_eq!(stats.silence_out, 5);

        // Empty buffer: all silence, still full length
        assert_eq!(jitter.pull_block_vec(4), vec![0.0; 4]);
        assert_eq!(jitter.stats().underruns, 2);
    }

    #[test]
    fn test_high_water_drops_oldest() {
        let jitter = JitterBuffer::new(16_000, PcmEndian::Little, 4);
        let codes: Vec<i16> = (1..=6).map(|i| i * 4096).collect();
        assert_eq!(jitter.on_audio_payload(&payload(&codes)).unwrap(), 6);

        assert_eq!(jitter.buffered(), 4);
        assert_eq!(jitter.stats().overrun_samples, 2);
        assert_eq!(jitter.pull_block_vec(4), vec![0.375, 0.5, 0.625, 0.75]);
    }

    #[test]
    fn test_bad_pcm_dropped_whole() {
        let jitter = JitterBuffer::new(16_000, PcmEndian::Little, 16);
        assert!(jitter.on_audio_payload(&[1, 2, 3]).is_err());
        assert_eq!(jitter.buffered(), 0);
        assert_eq!(jitter.stats().decode_errors, 1);

        // Subsequent payloads are unaffected
        jitter.on_audio_payload(&payload(&[16384])).unwrap();
        assert_eq!(jitter.buffered(), 1);
    }

    #[test]
    fn test_detached_outputs_silence() {
        let jitter = JitterBuffer::new(16_000, PcmEndian::Little, 16);
        jitter.on_audio_payload(&payload(&[16384, 16384])).unwrap();
        jitter.detach();

        assert_eq!(jitter.pull_block_vec(2), vec![0.0, 0.0]);
        assert_eq!(jitter.on_audio_payload(&payload(&[16384])).unwrap(), 0);
    }

    #[test]
    fn test_irregular_arrival_fixed_pull() {
        let jitter = JitterBuffer::new(16_000, PcmEndian::Little, 2048);
        // Bursty producer: sizes vary, some ticks deliver nothing
        let bursts = [0usize, 700, 0, 0, 1500, 30, 0, 256, 900, 0, 0, 0, 64];
        let mut fed = 0u64;
        let mut real = 0u64;

        for (tick, &burst) in bursts.iter().enumerate() {
            if burst > 0 {
                let codes: Vec<i16> = (0..burst).map(|i| ((i + tick) % 7) as i16 * 1000 + 100).collect();
                jitter.on_audio_payload(&payload(&codes)).unwrap();
                fed += burst as u64;
            }
            let block = jitter.pull_block_vec(256);
            assert_eq!(block.len(), 256);
            real += block.iter().filter(|s| **s != 0.0).count() as u64;
        }

        assert!(real <= fed);
        let stats = jitter.stats();
        assert_eq!(stats.samples_out + stats.silence_out, 256 * bursts.len() as u64);
        assert!(stats.samples_out <= stats.samples_in);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let jitter = Arc::new(JitterBuffer::new(16_000, PcmEndian::Little, 4096));
        let producer = {
            let jitter = jitter.clone();
            std::thread::spawn(move || {
                let chunk = payload(&[16384; 320]);
                for _ in 0..200 {
                    jitter.on_audio_payload(&chunk).unwrap();
                    if jitter.buffered() > 2048 {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut real = 0u64;
        let mut out = [0.0f32; 128];
        for _ in 0..1000 {
            real += jitter.pull_block(&mut out) as u64;
            assert!(out.iter().all(|s| *s == 0.0 || *s == 0.5));
        }
        producer.join().unwrap();

        assert!(real <= 320 * 200);
    }
}
