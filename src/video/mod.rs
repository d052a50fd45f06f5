//! Video frame sink
//!
//! Decoded frames land in a single latest-wins slot. Readers (the render
//! surface, the HTTP frame endpoint) always see the newest successfully
//! decoded frame; nothing is queued.

pub mod worker;

pub use worker::VideoDecodeWorker;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::codec::ImageDecoder;
use crate::error::CodecError;
use crate::inference::InferenceThrottle;

/// One decoded still frame
#[derive(Debug)]
pub struct VideoFrame {
    /// Position among successfully decoded frames of this connection
    pub seq: u64,
    pub received_at: DateTime<Utc>,
    /// Payload as received, kept for re-serving without re-encoding
    pub encoded: Bytes,
    pub image: RgbImage,
}

impl VideoFrame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Latest-wins slot holding the newest decoded frame
#[derive(Clone)]
pub struct FrameSlot {
    tx: Arc<watch::Sender<Option<Arc<VideoFrame>>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the slot content, waking subscribers
    pub fn publish(&self, frame: Arc<VideoFrame>) {
        self.tx.send_replace(Some(frame));
    }

    pub fn current(&self) -> Option<Arc<VideoFrame>> {
        self.tx.borrow().clone()
    }

    /// Receiver that is notified on every publish
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<VideoFrame>>> {
        self.tx.subscribe()
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Video path counters, shared with status readers
#[derive(Debug, Default)]
pub struct VideoCounters {
    received: AtomicU64,
    decoded: AtomicU64,
    decode_errors: AtomicU64,
    skipped: AtomicU64,
}

impl VideoCounters {
    pub(crate) fn record_skipped(&self, n: u64) {
        self.skipped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> VideoStats {
        VideoStats {
            received: self.received.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Video statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct VideoStats {
    pub received: u64,
    pub decoded: u64,
    pub decode_errors: u64,
    /// Payloads replaced before decode because a newer one arrived
    pub skipped: u64,
}

/// Decodes video payloads and publishes them
pub struct VideoSink {
    decoder: Box<dyn ImageDecoder>,
    slot: FrameSlot,
    counters: Arc<VideoCounters>,
    inference: Option<Arc<InferenceThrottle>>,
    next_seq: u64,
}

impl VideoSink {
    pub fn new(decoder: Box<dyn ImageDecoder>, slot: FrameSlot, counters: Arc<VideoCounters>) -> Self {
        Self {
            decoder,
            slot,
            counters,
            inference: None,
            next_seq: 0,
        }
    }

    /// Offer every decoded frame to `throttle`
    pub fn with_inference(mut self, throttle: Arc<InferenceThrottle>) -> Self {
        self.inference = Some(throttle);
        self
    }

    /// Decode `payload` and make it the current frame.
    ///
    /// A payload that fails to decode is dropped; the previous frame stays
    /// current. Empty payloads carry no frame and are ignored.
    pub fn on_video_payload(&mut self, payload: Bytes) -> Result<Option<Arc<VideoFrame>>, CodecError> {
        if payload.is_empty() {
            return Ok(None);
        }

        let image = match self.decoder.decode(&payload) {
            Ok(image) => image,
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping video payload ({} bytes): {}", payload.len(), e);
                return Err(e);
            }
        };

        let frame = Arc::new(VideoFrame {
            seq: self.next_seq,
            received_at: Utc::now(),
            encoded: payload,
            image,
        });
        self.next_seq += 1;
        self.counters.decoded.fetch_add(1, Ordering::Relaxed);

        self.slot.publish(frame.clone());
        if let Some(throttle) = &self.inference {
            throttle.on_frame_available(frame.clone());
        }
        Ok(Some(frame))
    }

    pub fn slot(&self) -> &FrameSlot {
        &self.slot
    }

    pub fn counters(&self) -> &Arc<VideoCounters> {
        &self.counters
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::jpeg::encode_jpeg;
    use crate::codec::JpegDecoder;

    pub(crate) fn jpeg(width: u32, height: u32, shade: u8) -> Bytes {
        let image = RgbImage::from_pixel(width, height, image::Rgb([shade, shade, shade]));
        Bytes::from(encode_jpeg(&image).unwrap())
    }

    fn sink() -> VideoSink {
        VideoSink::new(Box::new(JpegDecoder), FrameSlot::new(), Arc::new(VideoCounters::default()))
    }

    #[test]
    fn test_latest_frame_wins() {
        let mut sink = sink();
        let mut rx = sink.slot().subscribe();

        sink.on_video_payload(jpeg(8, 8, 10)).unwrap();
        sink.on_video_payload(jpeg(16, 8, 200)).unwrap();

        let current = sink.slot().current().unwrap();
        assert_eq!(current.seq, 1);
        assert_eq!((current.width(), current.height()), (16, 8));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().seq, 1);
    }

    #[test]
    fn test_bad_payload_keeps_previous_frame() {
        let mut sink = sink();
        sink.on_video_payload(jpeg(8, 8, 10)).unwrap();

        let err = sink.on_video_payload(Bytes::from_static(b"not a jpeg")).unwrap_err();
        assert!(matches!(err, CodecError::ImageDecode(_)));

        assert_eq!(sink.slot().current().unwrap().seq, 0);
        let stats = sink.counters().snapshot();
        assert_eq!(stats.decoded, 1);
        assert_eq!(stats.decode_errors, 1);
    }

    #[test]
    fn test_empty_payload_ignored() {
        let mut sink = sink();
        assert!(sink.on_video_payload(Bytes::new()).unwrap().is_none());
        assert!(sink.slot().current().is_none());
    }
}
