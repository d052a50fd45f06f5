//! Microphone capture for talk-back
//!
//! The input stream runs on a dedicated thread. Its callback downmixes to
//! mono and hands blocks over a bounded channel; when the consumer falls
//! behind, new blocks are dropped rather than queued.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::AudioFrame;
use crate::audio::device::{find_device, Direction};
use crate::error::AudioError;

/// Mono capture from one input device
pub struct AudioCapture {
    device_name: Option<String>,
    config: StreamConfig,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
    frame_tx: Sender<AudioFrame>,
    sequence: Arc<AtomicU32>,
    samples_captured: Arc<AtomicU64>,
    blocks_dropped: Arc<AtomicU64>,
}

impl AudioCapture {
    /// Create a capture delivering mono blocks into `frame_tx`
    pub fn new(
        device_name: Option<String>,
        sample_rate: u32,
        frame_tx: Sender<AudioFrame>,
    ) -> Result<Self, AudioError> {
        let device = find_device(device_name.as_deref(), Direction::Input)?;
        let default_config = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

        let config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device_name,
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
            frame_tx,
            sequence: Arc::new(AtomicU32::new(0)),
            samples_captured: Arc::new(AtomicU64::new(0)),
            blocks_dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Start capturing audio
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = find_device(self.device_name.as_deref(), Direction::Input)?;
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let frame_tx = self.frame_tx.clone();
        let sequence = self.sequence.clone();
        let samples_captured = self.samples_captured.clone();
        let blocks_dropped = self.blocks_dropped.clone();
        let config = self.config.clone();
        let channels = self.config.channels as usize;

        self.sequence.store(0, Ordering::SeqCst);
        self.samples_captured.store(0, Ordering::SeqCst);
        let start_time = Instant::now();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }

                        let samples = downmix(data, channels);
                        samples_captured.fetch_add(samples.len() as u64, Ordering::Relaxed);

                        let frame = AudioFrame::new(
                            samples,
                            start_time.elapsed().as_micros() as u64,
                            sequence.fetch_add(1, Ordering::Relaxed),
                        );

                        if let Err(TrySendError::Full(_)) = frame_tx.try_send(frame) {
                            blocks_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("Failed to start capture stream: {}", e);
                            return;
                        }

                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                        // Stream is dropped here, stopping capture
                    }
                    Err(e) => {
                        tracing::error!("Failed to build capture stream: {}", e);
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        tracing::info!(
            "Audio capture started at {} Hz from {} channel(s)",
            self.config.sample_rate.0,
            self.config.channels
        );
        Ok(())
    }

    /// Stop capturing and release the device. Blocks until the capture
    /// thread has exited, so no further frames are produced afterwards.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    pub fn samples_captured(&self) -> u64 {
        self.samples_captured.load(Ordering::Relaxed)
    }

    /// Blocks dropped because the consumer was behind
    pub fn blocks_dropped(&self) -> u64 {
        self.blocks_dropped.load(Ordering::Relaxed)
    }

    /// Check for errors
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Average interleaved channels down to mono
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
