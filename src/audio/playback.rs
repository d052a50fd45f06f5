//! Audio output to a playback device
//!
//! The cpal output callback runs on the host's real-time thread. It only
//! pulls from the jitter buffer, which never blocks, and fans the mono
//! block out to every device channel.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{StreamConfig, SupportedBufferSize};
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::JitterBuffer;
use crate::audio::device::{find_device, Direction};
use crate::error::AudioError;

/// Scratch frames allocated when neither config nor device says more
const DEFAULT_SCRATCH_FRAMES: usize = 4096;

/// Ceiling on scratch space; larger callbacks are served in pieces
const MAX_SCRATCH_FRAMES: usize = 64 * 1024;

/// Plays one connection's jitter buffer through an output device
pub struct AudioPlayback {
    device_name: Option<String>,
    block_frames: Option<u32>,
    jitter: Arc<JitterBuffer>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
}

impl AudioPlayback {
    pub fn new(device_name: Option<String>, block_frames: Option<u32>, jitter: Arc<JitterBuffer>) -> Self {
        Self {
            device_name,
            block_frames,
            jitter,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
        }
    }

    /// Open the output stream and start pulling.
    ///
    /// The stream lives on its own thread; this returns once it is playing
    /// or has failed to open.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = find_device(self.device_name.as_deref(), Direction::Output)?;
        let default_config = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

        let channels = default_config.channels();
        let scratch_len = scratch_frames(self.block_frames, default_config.buffer_size());
        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(self.jitter.sample_rate()),
            buffer_size: match self.block_frames {
                Some(frames) => cpal::BufferSize::Fixed(frames),
                None => cpal::BufferSize::Default,
            },
        };

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let jitter = self.jitter.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let channels = channels as usize;
                // Never reallocated inside the callback
                let mut scratch = vec![0.0f32; scratch_len];

                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        fill_output(data, channels, &mut scratch, &jitter);
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream.map_err(|e| AudioError::StreamError(e.to_string())) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, releasing the device
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::info!(
                    "Audio output started at {} Hz, {} channel(s)",
                    self.jitter.sample_rate(),
                    channels
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.stop();
                Err(e)
            }
            Err(_) => {
                self.stop();
                Err(AudioError::StreamError("output thread exited during startup".into()))
            }
        }
    }

    /// Stop the output stream and release the device
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Next asynchronous stream error, if any
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Scratch frames for the output callback, from the configured block size
/// and the largest buffer the device reports
fn scratch_frames(block_frames: Option<u32>, supported: &SupportedBufferSize) -> usize {
    let device_max = match supported {
        SupportedBufferSize::Range { max, .. } => *max as usize,
        SupportedBufferSize::Unknown => 0,
    };
    (block_frames.unwrap_or(0) as usize)
        .max(device_max)
        .clamp(DEFAULT_SCRATCH_FRAMES, MAX_SCRATCH_FRAMES)
}

/// Fill an interleaved output buffer from the jitter buffer, copying each
/// mono sample to every channel. Works through `data` in scratch-sized
/// pieces so it never allocates.
fn fill_output(data: &mut [f32], channels: usize, scratch: &mut [f32], jitter: &JitterBuffer) {
    let channels = channels.max(1);
    let piece = scratch.len().max(1) * channels;
    for chunk in data.chunks_mut(piece) {
        let block = &mut scratch[..chunk.len() / channels];
        jitter.pull_block(block);
        for (frame, &sample) in chunk.chunks_exact_mut(channels).zip(block.iter()) {
            frame.fill(sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PcmEndian;

    fn jitter_with(codes: &[i16]) -> JitterBuffer {
        let jitter = JitterBuffer::new(16_000, PcmEndian::Little, 16_000);
        let bytes: Vec<u8> = codes.iter().flat_map(|c| c.to_le_bytes()).collect();
        jitter.on_audio_payload(&bytes).unwrap();
        jitter
    }

    #[test]
    fn test_scratch_sized_up_front() {
        assert_eq!(scratch_frames(None, &SupportedBufferSize::Unknown), DEFAULT_SCRATCH_FRAMES);
        assert_eq!(scratch_frames(Some(8192), &SupportedBufferSize::Unknown), 8192);
        assert_eq!(
            scratch_frames(Some(256), &SupportedBufferSize::Range { min: 16, max: 16384 }),
            16384
        );
        assert_eq!(
            scratch_frames(None, &SupportedBufferSize::Range { min: 16, max: u32::MAX }),
            MAX_SCRATCH_FRAMES
        );
    }

    #[test]
    fn test_fill_fans_out_to_channels() {
        let jitter = jitter_with(&[16384, -16384]);
        let mut scratch = vec![0.0f32; 8];
        let mut data = [1.0f32; 6];

        fill_output(&mut data, 2, &mut scratch, &jitter);
        assert_eq!(data, [0.5, 0.5, -0.5, -0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_fill_larger_than_scratch() {
        let jitter = jitter_with(&[8192, 16384, -8192, -16384, 8192]);
        let mut scratch = vec![0.0f32; 2];
        let mut data = [1.0f32; 12];

        fill_output(&mut data, 2, &mut scratch, &jitter);
        assert_eq!(
            data,
            [0.25, 0.25, 0.5, 0.5, -0.25, -0.25, -0.5, -0.5, 0.25, 0.25, 0.0, 0.0]
        );
        assert_eq!(scratch.len(), 2);
    }
}
