//! Talk-back uplink
//!
//! Captured microphone blocks are converted to 16-bit PCM and sent as
//! audio-only packets (`videoSize = 0`). Sends are gated on the connection
//! streaming and on the writer queue having room; a block that cannot be
//! queued is dropped.

use bytes::Bytes;
use crossbeam_channel::bounded;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::{AudioCapture, AudioFrame};
use crate::codec::{pcm, FrameCodec};
use crate::config::{AppConfig, PcmEndian};
use crate::error::{Error, NetworkError};
use crate::network::connection::{CloseReason, ConnectionCell, ConnectionEvent, ConnectionState};
use crate::network::transport::{self, WriterHandle};

/// Result of offering one block to the uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Connection is not streaming; block discarded
    NotStreaming,
    /// Writer queue is full; block discarded
    Backpressured,
    /// Writer has gone away
    Closed,
}

#[derive(Debug, Default)]
struct Counters {
    blocks_sent: AtomicU64,
    samples_sent: AtomicU64,
    bytes_queued: AtomicU64,
    dropped_not_streaming: AtomicU64,
    dropped_backpressure: AtomicU64,
}

/// Uplink statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct UplinkStats {
    pub blocks_sent: u64,
    pub samples_sent: u64,
    pub bytes_queued: u64,
    pub dropped_not_streaming: u64,
    pub dropped_backpressure: u64,
}

/// Converts captured samples into packets for the writer queue
#[derive(Clone)]
pub struct UplinkEncoder {
    state: ConnectionCell,
    tx: mpsc::Sender<Bytes>,
    endian: PcmEndian,
    counters: Arc<Counters>,
}

impl UplinkEncoder {
    pub fn new(state: ConnectionCell, tx: mpsc::Sender<Bytes>, endian: PcmEndian) -> Self {
        Self {
            state,
            tx,
            endian,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Encode and queue one block of mono samples
    pub fn send_uplink_audio(&self, samples: &[f32]) -> SendOutcome {
        if !self.state.is_streaming() {
            self.counters
                .dropped_not_streaming
                .fetch_add(1, Ordering::Relaxed);
            return SendOutcome::NotStreaming;
        }

        let audio = pcm::encode(samples, self.endian);
        let packet = FrameCodec::encode(&[], &audio);
        let len = packet.len() as u64;

        match self.tx.try_send(packet) {
            Ok(()) => {
                self.counters.blocks_sent.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .samples_sent
                    .fetch_add(samples.len() as u64, Ordering::Relaxed);
                self.counters.bytes_queued.fetch_add(len, Ordering::Relaxed);
                SendOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters
                    .dropped_backpressure
                    .fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Uplink queue full, dropping {} samples", samples.len());
                SendOutcome::Backpressured
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    pub fn stats(&self) -> UplinkStats {
        UplinkStats {
            blocks_sent: self.counters.blocks_sent.load(Ordering::Relaxed),
            samples_sent: self.counters.samples_sent.load(Ordering::Relaxed),
            bytes_queued: self.counters.bytes_queued.load(Ordering::Relaxed),
            dropped_not_streaming: self.counters.dropped_not_streaming.load(Ordering::Relaxed),
            dropped_backpressure: self.counters.dropped_backpressure.load(Ordering::Relaxed),
        }
    }
}

/// Regroups capture callbacks of any size into fixed-size blocks
struct Blocker {
    block_size: usize,
    partial: Vec<f32>,
}

impl Blocker {
    fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            partial: Vec::with_capacity(block_size),
        }
    }

    fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(&[f32])) {
        while !samples.is_empty() {
            let take = (self.block_size - self.partial.len()).min(samples.len());
            self.partial.extend_from_slice(&samples[..take]);
            samples = &samples[take..];
            if self.partial.len() == self.block_size {
                emit(&self.partial);
                self.partial.clear();
            }
        }
    }
}

/// One talk-back connection: capture, encoder and socket writer
pub struct Uplink {
    id: Uuid,
    state: ConnectionCell,
    encoder: Option<UplinkEncoder>,
    capture: Option<AudioCapture>,
    pump: Option<JoinHandle<()>>,
    writer: Option<WriterHandle>,
}

impl Uplink {
    /// Connect to the device's talk-back port
    pub async fn connect(config: &AppConfig) -> Result<Self, Error> {
        let id = Uuid::new_v4();
        let state = ConnectionCell::new("uplink");
        let addr = config.network.uplink_addr();

        state.apply(ConnectionEvent::Connect);
        let stream = match transport::connect(&addr, &config.network).await {
            Ok(stream) => stream,
            Err(e) => {
                state.apply(ConnectionEvent::TransportError(e.to_string()));
                return Err(e.into());
            }
        };

        let (tx, rx) = mpsc::channel(config.uplink.send_queue_depth.max(1));
        let writer = transport::spawn_writer(stream, rx, state.clone());
        state.apply(ConnectionEvent::Opened);
        tracing::info!("Uplink {} streaming to {}", id, addr);

        Ok(Self {
            id,
            state: state.clone(),
            encoder: Some(UplinkEncoder::new(state, tx, config.uplink.pcm_endian)),
            capture: None,
            pump: None,
            writer: Some(writer),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Encoder for feeding samples directly instead of from a microphone
    pub fn encoder(&self) -> Option<&UplinkEncoder> {
        self.encoder.as_ref()
    }

    pub fn stats(&self) -> UplinkStats {
        self.encoder.as_ref().map(|e| e.stats()).unwrap_or_default()
    }

    /// Open the microphone and start streaming it
    pub fn start_capture(&mut self, config: &AppConfig) -> Result<(), Error> {
        let encoder = self
            .encoder
            .clone()
            .ok_or(NetworkError::NotStreaming)?;

        let (frame_tx, frame_rx) = bounded::<AudioFrame>(32);
        let mut capture = AudioCapture::new(
            config.uplink.input_device.clone(),
            config.uplink.sample_rate,
            frame_tx,
        )?;

        let block_size = config.uplink.block_size;
        let pump = thread::Builder::new()
            .name("uplink-pump".to_string())
            .spawn(move || {
                let mut blocker = Blocker::new(block_size);
                // Ends once the capture side drops its senders
                for frame in frame_rx.iter() {
                    blocker.push(&frame.samples, |block| {
                        encoder.send_uplink_audio(block);
                    });
                }
                if !blocker.partial.is_empty() {
                    tracing::debug!("Discarding {} unsent uplink samples", blocker.partial.len());
                }
            })?;

        capture.start()?;
        self.capture = Some(capture);
        self.pump = Some(pump);
        Ok(())
    }

    /// Tear down in order: stop capture, cancel the pending block, drain
    /// queued packets and close the socket.
    pub async fn shutdown(mut self) -> CloseReason {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
            while let Some(e) = capture.check_errors() {
                tracing::warn!("Audio capture reported: {}", e);
            }
            tracing::debug!(
                "Uplink capture stopped after {} samples, {} block(s) dropped",
                capture.samples_captured(),
                capture.blocks_dropped()
            );
        }
        if let Some(pump) = self.pump.take() {
            let _ = tokio::task::spawn_blocking(move || pump.join()).await;
        }

        self.state.apply(ConnectionEvent::Shutdown);
        let stats = self.stats();
        // Last sender gone: the writer drains and shuts the socket
        self.encoder.take();

        if let Some(writer) = self.writer.take() {
            writer.finish().await;
        }
        self.state.finish(CloseReason::Local);

        tracing::info!(
            "Uplink {} closed: {} block(s) sent, {} dropped on backpressure",
            self.id,
            stats.blocks_sent,
            stats.dropped_backpressure
        );
        match self.state.get() {
            ConnectionState::Closed(reason) => reason,
            _ => CloseReason::Local,
        }
    }
}
