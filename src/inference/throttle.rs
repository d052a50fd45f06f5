//! Dispatch throttle and inference worker

use chrono::Utc;
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{CancelToken, Classifier, DetectionEvent, KeywordMatcher};
use crate::error::{Error, InferenceError};
use crate::video::VideoFrame;

/// What happened to a frame offered for inference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Sent to the classifier
    Dispatched,
    /// Too soon after the previous dispatch
    Throttled,
    /// A classification is still running
    Busy,
    /// The worker has shut down
    Closed,
}

#[derive(Debug, Default)]
struct Counters {
    offered: AtomicU64,
    dispatched: AtomicU64,
    throttled: AtomicU64,
    busy: AtomicU64,
    completed: AtomicU64,
    failures: AtomicU64,
    detections: AtomicU64,
}

/// Inference statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct InferenceStats {
    pub offered: u64,
    pub dispatched: u64,
    pub throttled: u64,
    pub busy: u64,
    pub completed: u64,
    pub failures: u64,
    pub detections: u64,
}

/// Rate-limits frames into a classifier running on its own thread.
///
/// At most one classification is outstanding. Frames arriving while one is
/// running, or sooner than the minimum interval after the last dispatch, are
/// not queued; presentation never waits on this path.
pub struct InferenceThrottle {
    min_interval: Duration,
    last_dispatch: Mutex<Option<Instant>>,
    in_flight: Arc<AtomicBool>,
    request_tx: Mutex<Option<Sender<Arc<VideoFrame>>>>,
    events: broadcast::Sender<DetectionEvent>,
    counters: Arc<Counters>,
    cancel: Option<CancelToken>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InferenceThrottle {
    /// Start the inference worker
    pub fn spawn(
        mut classifier: Box<dyn Classifier>,
        matcher: KeywordMatcher,
        min_interval: Duration,
        events: broadcast::Sender<DetectionEvent>,
    ) -> Result<Self, Error> {
        let (request_tx, request_rx) = bounded::<Arc<VideoFrame>>(1);
        let in_flight = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());
        let cancel = classifier.cancel_token();

        let worker_in_flight = in_flight.clone();
        let worker_counters = counters.clone();
        let worker_events = events.clone();

        let handle = thread::Builder::new()
            .name("inference".to_string())
            .spawn(move || {
                for frame in request_rx.iter() {
                    let started = Instant::now();
                    match classifier.classify(&frame) {
                        Ok(predictions) => {
                            worker_counters.completed.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(
                                "Classified frame {} in {:?}: {} label(s)",
                                frame.seq,
                                started.elapsed(),
                                predictions.len()
                            );

                            if let Some(best) = matcher.best_match(&predictions) {
                                let event = DetectionEvent {
                                    id: Uuid::new_v4(),
                                    timestamp: Utc::now(),
                                    label: best.label.clone(),
                                    confidence: best.score,
                                    source: classifier.name().to_string(),
                                    frame_seq: frame.seq,
                                };
                                worker_counters.detections.fetch_add(1, Ordering::Relaxed);
                                tracing::info!(
                                    "Detected '{}' ({:.2}) on frame {}",
                                    event.label,
                                    event.confidence,
                                    event.frame_seq
                                );
                                // No subscribers is not an error
                                let _ = worker_events.send(event);
                            }
                        }
                        Err(InferenceError::Cancelled) => {
                            tracing::debug!("Classification of frame {} cancelled", frame.seq);
                        }
                        Err(e) => {
                            worker_counters.failures.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("Classifier failed on frame {}: {}", frame.seq, e);
                        }
                    }
                    worker_in_flight.store(false, Ordering::Release);
                }
            })?;

        tracing::info!("Inference worker started, min interval {:?}", min_interval);

        Ok(Self {
            min_interval,
            last_dispatch: Mutex::new(None),
            in_flight,
            request_tx: Mutex::new(Some(request_tx)),
            events,
            counters,
            cancel,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Offer a freshly decoded frame
    pub fn on_frame_available(&self, frame: Arc<VideoFrame>) -> Dispatch {
        self.on_frame_available_at(frame, Instant::now())
    }

    /// Offer a frame as of `now`
    pub fn on_frame_available_at(&self, frame: Arc<VideoFrame>, now: Instant) -> Dispatch {
        self.counters.offered.fetch_add(1, Ordering::Relaxed);

        let mut last = self.last_dispatch.lock();
        if let Some(previous) = *last {
            if now.saturating_duration_since(previous) < self.min_interval {
                self.counters.throttled.fetch_add(1, Ordering::Relaxed);
                return Dispatch::Throttled;
            }
        }

        if self.in_flight.swap(true, Ordering::AcqRel) {
            self.counters.busy.fetch_add(1, Ordering::Relaxed);
            return Dispatch::Busy;
        }

        let request_tx = self.request_tx.lock();
        let Some(tx) = request_tx.as_ref() else {
            self.in_flight.store(false, Ordering::Release);
            return Dispatch::Closed;
        };

        match tx.try_send(frame) {
            Ok(()) => {
                *last = Some(now);
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                Dispatch::Dispatched
            }
            Err(TrySendError::Full(_)) => {
                self.counters.busy.fetch_add(1, Ordering::Relaxed);
                Dispatch::Busy
            }
            Err(TrySendError::Disconnected(_)) => {
                self.in_flight.store(false, Ordering::Release);
                Dispatch::Closed
            }
        }
    }

    /// Whether a classification is running
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Receive every detection raised after this call
    pub fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.events.subscribe()
    }

    /// Invoke `callback` for each detection on a tokio task
    pub fn on_detection<F>(&self, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(DetectionEvent) + Send + 'static,
    {
        super::forward_detections(self.subscribe(), callback)
    }

    pub fn stats(&self) -> InferenceStats {
        InferenceStats {
            offered: self.counters.offered.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            throttled: self.counters.throttled.load(Ordering::Relaxed),
            busy: self.counters.busy.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            detections: self.counters.detections.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting frames, abort the running classification if the
    /// classifier supports it, and join the worker
    pub fn shutdown(&self) {
        // Dropping the only sender ends the worker loop
        self.request_tx.lock().take();
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InferenceThrottle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
