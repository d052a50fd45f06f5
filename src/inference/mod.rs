//! On-frame inference
//!
//! Frames are offered to a classifier at most once per configured interval,
//! on a dedicated worker thread. Matching labels become detection events on
//! a broadcast channel.

pub mod classifier;
pub mod throttle;

pub use classifier::{CancelToken, Classifier, CommandClassifier, KeywordMatcher, Prediction};
pub use throttle::{Dispatch, InferenceStats, InferenceThrottle};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events buffered per subscriber before the slowest one starts lagging
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A keyword matched on a classified frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub confidence: f32,
    /// Classifier that produced the label
    pub source: String,
    /// Sequence number of the classified frame
    pub frame_seq: u64,
}

/// Create the detection event channel
pub fn event_channel() -> broadcast::Sender<DetectionEvent> {
    let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}

/// Invoke `callback` for each event from `rx` on a tokio task.
///
/// Must be called from within a tokio runtime. The task ends when the
/// event channel closes.
pub fn forward_detections<F>(
    mut rx: broadcast::Receiver<DetectionEvent>,
    mut callback: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut(DetectionEvent) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => callback(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Detection listener lagged, {} event(s) missed", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
