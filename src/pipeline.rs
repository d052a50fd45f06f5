//! Downlink media pipeline
//!
//! A [`Downlink`] owns every per-connection resource on the receive side:
//! the demultiplexer's pending tail, the jitter buffer, the video decode
//! path and the inference worker. The transport feeds it chunks from a
//! single task; the audio device and the render surface read from it
//! concurrently through shared handles.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::audio::{AudioPlayback, JitterBuffer, JitterStats};
use crate::codec::{ImageDecoder, JpegDecoder, Packet};
use crate::config::{AppConfig, ProtocolProfile};
use crate::error::{Error, ProtocolError};
use crate::inference::{
    self, Classifier, CommandClassifier, DetectionEvent, InferenceStats, InferenceThrottle,
    KeywordMatcher,
};
use crate::network::connection::{CloseReason, ConnectionCell, ConnectionEvent, ConnectionState};
use crate::network::demux::{ChannelDemuxer, ChannelEvent, DemuxStats, MediaKind, StreamDemuxer};
use crate::video::{FrameSlot, VideoCounters, VideoDecodeWorker, VideoFrame, VideoSink, VideoStats};

/// Pluggable parts of a downlink
pub struct DownlinkParts {
    pub decoder: Box<dyn ImageDecoder>,
    pub classifier: Option<Box<dyn Classifier>>,
    /// Detection events outlive any single connection
    pub events: broadcast::Sender<DetectionEvent>,
}

impl DownlinkParts {
    /// JPEG decoding plus the configured classifier, if enabled
    pub fn from_config(config: &AppConfig, events: broadcast::Sender<DetectionEvent>) -> Result<Self, Error> {
        let classifier: Option<Box<dyn Classifier>> = if config.inference.enabled {
            Some(Box::new(
                CommandClassifier::from_command(&config.inference.command)?
                    .with_timeout(Duration::from_millis(config.inference.timeout_ms)),
            ))
        } else {
            None
        };

        Ok(Self {
            decoder: Box::new(JpegDecoder),
            classifier,
            events,
        })
    }
}

enum Demux {
    Multiplexed(StreamDemuxer),
    Split {
        video: ChannelDemuxer,
        audio: ChannelDemuxer,
    },
    Released,
}

enum VideoPath {
    Inline(VideoSink),
    Worker(VideoDecodeWorker),
}

impl VideoPath {
    fn submit(&mut self, payload: Bytes) {
        match self {
            VideoPath::Inline(sink) => {
                sink.counters().record_received();
                // Failures are counted and logged by the sink
                let _ = sink.on_video_payload(payload);
            }
            VideoPath::Worker(worker) => worker.submit(payload),
        }
    }
}

/// Receive side of one connection
pub struct Downlink {
    id: Uuid,
    state: ConnectionCell,
    accepting: bool,
    demux: Demux,
    demux_stats: Arc<Mutex<DemuxStats>>,
    jitter: Option<Arc<JitterBuffer>>,
    output: Option<AudioPlayback>,
    video: Option<VideoPath>,
    frames: FrameSlot,
    video_counters: Arc<VideoCounters>,
    inference: Option<Arc<InferenceThrottle>>,
    events: broadcast::Sender<DetectionEvent>,
}

impl Downlink {
    /// Build the pipeline for one connection at a fixed sample rate
    pub fn new(
        config: &AppConfig,
        sample_rate: u32,
        state: ConnectionCell,
        parts: DownlinkParts,
    ) -> Result<Self, Error> {
        let id = Uuid::new_v4();
        let max_payload = config.network.max_payload_size;

        let demux = match config.network.profile {
            ProtocolProfile::Multiplexed => Demux::Multiplexed(StreamDemuxer::new(max_payload)),
            ProtocolProfile::SplitChannels => Demux::Split {
                video: ChannelDemuxer::new(MediaKind::Video, max_payload, false),
                // Any preamble was consumed while negotiating the rate
                audio: ChannelDemuxer::new(MediaKind::Audio, max_payload, false),
            },
        };

        let high_water = crate::config::high_water_samples(sample_rate, config.audio.high_water_ms);
        let jitter = Arc::new(JitterBuffer::new(sample_rate, config.audio.pcm_endian, high_water));

        let inference = match parts.classifier {
            Some(classifier) => Some(Arc::new(InferenceThrottle::spawn(
                classifier,
                KeywordMatcher::new(&config.inference.keywords, config.inference.min_score),
                Duration::from_millis(config.inference.min_interval_ms),
                parts.events.clone(),
            )?)),
            None => None,
        };

        let frames = FrameSlot::new();
        let video_counters = Arc::new(VideoCounters::default());
        let mut sink = VideoSink::new(parts.decoder, frames.clone(), video_counters.clone());
        if let Some(throttle) = &inference {
            sink = sink.with_inference(throttle.clone());
        }
        let video = if config.video.decode_worker {
            VideoPath::Worker(VideoDecodeWorker::spawn(sink)?)
        } else {
            VideoPath::Inline(sink)
        };

        tracing::info!(
            "Downlink {} ready: {:?}, {} Hz, high-water {} samples",
            id,
            config.network.profile,
            sample_rate,
            high_water
        );

        Ok(Self {
            id,
            state,
            accepting: true,
            demux,
            demux_stats: Arc::new(Mutex::new(DemuxStats::default())),
            jitter: Some(jitter),
            output: None,
            video: Some(video),
            frames,
            video_counters,
            inference,
            events: parts.events,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connection(&self) -> &ConnectionCell {
        &self.state
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Jitter buffer for an audio output to pull from
    pub fn jitter(&self) -> Option<Arc<JitterBuffer>> {
        self.jitter.clone()
    }

    /// Hand over the audio output so teardown can stop it in order
    pub fn attach_output(&mut self, output: AudioPlayback) {
        self.output = Some(output);
    }

    /// Feed bytes from the multiplexed stream.
    ///
    /// Returns the number of packets completed by this chunk. A protocol
    /// error stops the downlink accepting further chunks and moves the
    /// connection to `Closing`; the caller must then tear down.
    pub fn submit_chunk(&mut self, chunk: &[u8]) -> Result<usize, ProtocolError> {
        if !self.accepting {
            return Ok(0);
        }

        let Self {
            demux,
            jitter,
            video,
            ..
        } = self;
        let result = match demux {
            Demux::Multiplexed(demux) => demux.push(chunk, |packet| route_packet(packet, jitter, video)),
            _ => Ok(0),
        };
        self.after_push(result)
    }

    /// Feed bytes from the split-profile video channel
    pub fn submit_video_chunk(&mut self, chunk: &[u8]) -> Result<usize, ProtocolError> {
        if !self.accepting {
            return Ok(0);
        }

        let Self { demux, video, .. } = self;
        let result = match demux {
            Demux::Split { video: demux, .. } => demux.push(chunk, |event| {
                if let (ChannelEvent::Payload(payload), Some(video)) = (event, video.as_mut()) {
                    if !payload.is_empty() {
                        video.submit(payload);
                    }
                }
            }),
            _ => Ok(0),
        };
        self.after_push(result)
    }

    /// Feed bytes from the split-profile audio channel
    pub fn submit_audio_chunk(&mut self, chunk: &[u8]) -> Result<usize, ProtocolError> {
        if !self.accepting {
            return Ok(0);
        }

        let Self { demux, jitter, .. } = self;
        let result = match demux {
            Demux::Split { audio: demux, .. } => demux.push(chunk, |event| match event {
                ChannelEvent::Payload(payload) => route_audio(&payload, jitter),
                ChannelEvent::SampleRate(rate) => {
                    tracing::warn!("Ignoring sample rate change to {} Hz mid-stream", rate);
                }
            }),
            _ => Ok(0),
        };
        self.after_push(result)
    }

    fn after_push(&mut self, result: Result<usize, ProtocolError>) -> Result<usize, ProtocolError> {
        *self.demux_stats.lock() = match &self.demux {
            Demux::Multiplexed(demux) => demux.stats(),
            Demux::Split { video, audio } => sum_stats(&video.stats(), &audio.stats()),
            Demux::Released => DemuxStats::default(),
        };

        if let Err(e) = &result {
            tracing::error!("Downlink {} protocol error: {}", self.id, e);
            self.accepting = false;
            self.state
                .apply(ConnectionEvent::ProtocolViolation(e.to_string()));
        }
        result
    }

    /// Fill `out` with the next audio samples, silence where none are
    /// buffered. Never blocks.
    pub fn pull_audio_block(&self, out: &mut [f32]) -> usize {
        match &self.jitter {
            Some(jitter) => jitter.pull_block(out),
            None => {
                out.fill(0.0);
                0
            }
        }
    }

    /// Newest decoded frame
    pub fn current_video_frame(&self) -> Option<Arc<VideoFrame>> {
        self.frames.current()
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<Option<Arc<VideoFrame>>> {
        self.frames.subscribe()
    }

    /// Receive detections raised after this call
    pub fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.events.subscribe()
    }

    /// Invoke `callback` for each detection on a tokio task
    pub fn on_detection<F>(&self, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(DetectionEvent) + Send + 'static,
    {
        inference::forward_detections(self.subscribe(), callback)
    }

    /// Cloneable read-only view for status and rendering
    pub fn handle(&self) -> DownlinkHandle {
        DownlinkHandle {
            id: self.id,
            state: self.state.clone(),
            demux: self.demux_stats.clone(),
            jitter: self.jitter.as_ref().map(Arc::downgrade).unwrap_or_default(),
            frames: self.frames.clone(),
            video: self.video_counters.clone(),
            inference: self.inference.as_ref().map(Arc::downgrade),
        }
    }

    pub fn status(&self) -> DownlinkStatus {
        self.handle().status()
    }

    /// Release every per-connection resource.
    ///
    /// Order: stop accepting chunks, detach audio output, release the
    /// sample ring, stop the decode and inference workers. The transport
    /// is closed by the caller afterwards. Safe to call more than once.
    pub fn teardown(&mut self) {
        if matches!(self.demux, Demux::Released) {
            return;
        }

        self.accepting = false;
        self.state.apply(ConnectionEvent::Shutdown);

        if let Some(jitter) = &self.jitter {
            jitter.detach();
        }
        if let Some(mut output) = self.output.take() {
            while let Some(e) = output.check_errors() {
                tracing::warn!("Audio output reported: {}", e);
            }
            output.stop();
        }
        if let Some(jitter) = self.jitter.take() {
            let stats = jitter.stats();
            tracing::info!(
                "Downlink {} audio: {} samples in, {} out, {} underrun(s), {} overrun samples",
                self.id,
                stats.samples_in,
                stats.samples_out,
                stats.underruns,
                stats.overrun_samples
            );
        }

        match self.video.take() {
            Some(VideoPath::Worker(mut worker)) => worker.shutdown(),
            Some(VideoPath::Inline(_)) | None => {}
        }
        if let Some(throttle) = self.inference.take() {
            throttle.shutdown();
        }

        self.demux = Demux::Released;
        tracing::debug!("Downlink {} resources released", self.id);
    }

    /// Record the terminal state once the transport is closed
    pub fn finish(&self, reason: CloseReason) {
        self.state.finish(reason);
    }
}

impl Drop for Downlink {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn route_packet(packet: Packet, jitter: &Option<Arc<JitterBuffer>>, video: &mut Option<VideoPath>) {
    if !packet.video.is_empty() {
        if let Some(video) = video.as_mut() {
            video.submit(packet.video);
        }
    }
    if !packet.audio.is_empty() {
        route_audio(&packet.audio, jitter);
    }
}

fn route_audio(payload: &[u8], jitter: &Option<Arc<JitterBuffer>>) {
    if let Some(jitter) = jitter {
        if let Err(e) = jitter.on_audio_payload(payload) {
            tracing::warn!("Dropping audio payload: {}", e);
        }
    }
}

fn sum_stats(a: &DemuxStats, b: &DemuxStats) -> DemuxStats {
    DemuxStats {
        chunks: a.chunks + b.chunks,
        bytes: a.bytes + b.bytes,
        units: a.units + b.units,
        pending: a.pending + b.pending,
    }
}

/// Shared read-only view of a downlink.
///
/// Holds no strong reference to the sample ring or the inference worker,
/// so teardown really releases them.
#[derive(Clone)]
pub struct DownlinkHandle {
    id: Uuid,
    state: ConnectionCell,
    demux: Arc<Mutex<DemuxStats>>,
    jitter: Weak<JitterBuffer>,
    frames: FrameSlot,
    video: Arc<VideoCounters>,
    inference: Option<Weak<InferenceThrottle>>,
}

impl DownlinkHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn current_video_frame(&self) -> Option<Arc<VideoFrame>> {
        self.frames.current()
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<Option<Arc<VideoFrame>>> {
        self.frames.subscribe()
    }

    pub fn status(&self) -> DownlinkStatus {
        DownlinkStatus {
            id: self.id,
            state: self.state.get(),
            demux: self.demux.lock().clone(),
            audio: self.jitter.upgrade().map(|j| j.stats()),
            video: self.video.snapshot(),
            inference: self
                .inference
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|t| t.stats()),
        }
    }
}

/// Snapshot of one downlink
#[derive(Debug, Clone, Serialize)]
pub struct DownlinkStatus {
    pub id: Uuid,
    pub state: ConnectionState,
    pub demux: DemuxStats,
    /// `None` once the sample ring has been released
    pub audio: Option<JitterStats>,
    pub video: VideoStats,
    pub inference: Option<InferenceStats>,
}
