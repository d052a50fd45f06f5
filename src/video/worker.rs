//! Off-thread video decode
//!
//! The demultiplexer hands payloads over through a one-slot mailbox. If the
//! decoder is still busy when the next payload arrives, the waiting payload
//! is replaced and counted as skipped.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::VideoSink;
use crate::error::Error;

#[derive(Default)]
struct Mailbox {
    pending: Option<Bytes>,
    shutdown: bool,
}

struct Shared {
    mailbox: Mutex<Mailbox>,
    wake: Condvar,
}

/// Runs a [`VideoSink`] on a dedicated thread
pub struct VideoDecodeWorker {
    shared: Arc<Shared>,
    counters: Arc<super::VideoCounters>,
    thread_handle: Option<JoinHandle<()>>,
}

impl VideoDecodeWorker {
    /// Start the decode thread. The sink moves onto it.
    pub fn spawn(mut sink: VideoSink) -> Result<Self, Error> {
        let shared = Arc::new(Shared {
            mailbox: Mutex::new(Mailbox::default()),
            wake: Condvar::new(),
        });
        let counters = sink.counters().clone();

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("video-decode".to_string())
            .spawn(move || loop {
                let payload = {
                    let mut mailbox = worker_shared.mailbox.lock();
                    while mailbox.pending.is_none() && !mailbox.shutdown {
                        worker_shared.wake.wait(&mut mailbox);
                    }
                    if mailbox.shutdown {
                        break;
                    }
                    mailbox.pending.take()
                };

                if let Some(payload) = payload {
                    // Failures are counted and logged by the sink
                    let _ = sink.on_video_payload(payload);
                }
            })?;

        Ok(Self {
            shared,
            counters,
            thread_handle: Some(handle),
        })
    }

    /// Queue `payload` for decode, replacing any payload still waiting
    pub fn submit(&self, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        self.counters.record_received();

        let mut mailbox = self.shared.mailbox.lock();
        if mailbox.shutdown {
            return;
        }
        if mailbox.pending.replace(payload).is_some() {
            self.counters.record_skipped(1);
        }
        drop(mailbox);
        self.shared.wake.notify_one();
    }

    /// Whether a payload is waiting for the decoder
    pub fn has_pending(&self) -> bool {
        self.shared.mailbox.lock().pending.is_some()
    }

    /// Stop the thread and release the decoder. A payload still waiting is
    /// discarded and counted as skipped.
    pub fn shutdown(&mut self) {
        {
            let mut mailbox = self.shared.mailbox.lock();
            mailbox.shutdown = true;
            if mailbox.pending.take().is_some() {
                self.counters.record_skipped(1);
            }
        }
        self.shared.wake.notify_all();

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VideoDecodeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
