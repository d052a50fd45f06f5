//! Classifiers and label matching

use crossbeam_channel::{bounded, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::constants::DEFAULT_CLASSIFIER_TIMEOUT_MS;
use crate::error::InferenceError;
use crate::video::VideoFrame;

/// How often a running classifier process is checked for exit
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One label a classifier assigned to a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub score: f32,
}

impl Prediction {
    pub fn new(label: impl Into<String>, score: f32) -> Self {
        Self {
            label: label.into(),
            score,
        }
    }
}

/// Aborts classifications from another thread. Once cancelled, stays
/// cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Labels a still frame. Runs on the inference worker thread only.
pub trait Classifier: Send + 'static {
    /// Short name recorded as the source of detections
    fn name(&self) -> &str;

    fn classify(&mut self, frame: &VideoFrame) -> Result<Vec<Prediction>, InferenceError>;

    /// Token that makes a running `classify` return early, if supported
    fn cancel_token(&self) -> Option<CancelToken> {
        None
    }
}

/// Runs an external program once per frame.
///
/// The frame's JPEG bytes go to the program's stdin; it must print a JSON
/// array of `{"label": ..., "score": ...}` objects on stdout. A run that
/// exceeds the timeout or is cancelled is killed, and every process is
/// reaped before `classify` returns.
pub struct CommandClassifier {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
    cancel: CancelToken,
    last_pid: Option<u32>,
}

impl CommandClassifier {
    /// Build from a command line: program followed by arguments
    pub fn from_command(command: &[String]) -> Result<Self, InferenceError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| InferenceError::Spawn("empty classifier command".into()))?;
        let name = std::path::Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.clone());

        Ok(Self {
            name,
            program: program.clone(),
            args: args.to_vec(),
            timeout: Duration::from_millis(DEFAULT_CLASSIFIER_TIMEOUT_MS),
            cancel: CancelToken::new(),
            last_pid: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Process id of the most recent run
    pub fn last_pid(&self) -> Option<u32> {
        self.last_pid
    }
}

/// Kills and reaps a child that has not been seen to exit
struct Reaper {
    child: Child,
    exited: bool,
}

impl Reaper {
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        self.exited = status.is_some();
        Ok(status)
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if !self.exited {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl Classifier for CommandClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn classify(&mut self, frame: &VideoFrame) -> Result<Vec<Prediction>, InferenceError> {
        if self.cancel.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }

        let deadline = Instant::now() + self.timeout;
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| InferenceError::Spawn(format!("{}: {}", self.program, e)))?;
        self.last_pid = Some(child.id());
        let mut child = Reaper {
            child,
            exited: false,
        };

        // Pipes are serviced on helper threads; this one only supervises
        if let Some(mut stdin) = child.child.stdin.take() {
            let payload = frame.encoded.clone();
            thread::Builder::new()
                .name("classifier-stdin".to_string())
                .spawn(move || {
                    if let Err(e) = stdin.write_all(&payload) {
                        tracing::debug!("Classifier stopped reading its input: {}", e);
                    }
                })?;
        }
        let (output_tx, output_rx) = bounded::<std::io::Result<Vec<u8>>>(1);
        match child.child.stdout.take() {
            Some(mut stdout) => {
                thread::Builder::new()
                    .name("classifier-stdout".to_string())
                    .spawn(move || {
                        let mut output = Vec::new();
                        let result = stdout.read_to_end(&mut output).map(|_| output);
                        let _ = output_tx.send(result);
                    })?;
            }
            None => drop(output_tx),
        }

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if self.cancel.is_cancelled() {
                return Err(InferenceError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(InferenceError::Timeout(self.timeout.as_millis() as u64));
            }
            thread::sleep(CHILD_POLL_INTERVAL);
        };

        // A backgrounded grandchild may still hold stdout open
        let stdout = match output_rx.recv_deadline(deadline) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => {
                return Err(InferenceError::Timeout(self.timeout.as_millis() as u64))
            }
            Err(RecvTimeoutError::Disconnected) => Vec::new(),
        };

        if !status.success() {
            return Err(InferenceError::ExitStatus(status.to_string()));
        }
        parse_predictions(&stdout)
    }

    fn cancel_token(&self) -> Option<CancelToken> {
        Some(self.cancel.clone())
    }
}

/// Parse classifier output
pub fn parse_predictions(stdout: &[u8]) -> Result<Vec<Prediction>, InferenceError> {
    serde_json::from_slice(stdout).map_err(|e| InferenceError::MalformedOutput(e.to_string()))
}

/// Decides which predictions count as detections
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    keywords: Vec<String>,
    min_score: f32,
}

impl KeywordMatcher {
    pub fn new(keywords: &[String], min_score: f32) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            min_score,
        }
    }

    /// Case-insensitive substring match against any keyword
    pub fn matches(&self, prediction: &Prediction) -> bool {
        if prediction.score < self.min_score {
            return false;
        }
        let label = prediction.label.to_lowercase();
        self.keywords.iter().any(|k| label.contains(k.as_str()))
    }

    /// Highest-scoring matching prediction
    pub fn best_match<'a>(&self, predictions: &'a [Prediction]) -> Option<&'a Prediction> {
        predictions
            .iter()
            .filter(|p| self.matches(p))
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }
}
