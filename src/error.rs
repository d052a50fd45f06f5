//! Error types for the media pipeline
//!
//! The split mirrors how each failure is handled: protocol errors end the
//! connection, codec errors drop one payload, inference errors skip one
//! dispatch cycle.

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Payload decode errors. Never fatal to the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Image decode failed: {0}")]
    ImageDecode(String),

    #[error("PCM payload has odd length: {0} bytes")]
    OddPcmLength(usize),
}

/// Wire protocol violations. Fatal to the affected connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{kind} payload declares {declared} bytes, limit is {max}")]
    PayloadTooLarge {
        kind: &'static str,
        declared: u32,
        max: u32,
    },

    #[error("Invalid sample rate preamble: {0}")]
    InvalidPreamble(String),

    #[error("Stream was already rejected")]
    Rejected,
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection to {addr} failed: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("Connection closed before {0}")]
    ClosedEarly(&'static str),

    #[error("Channel is not streaming")]
    NotStreaming,
}

/// Classifier errors. Skip one dispatch cycle.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Classifier failed to start: {0}")]
    Spawn(String),

    #[error("Classifier exited with {0}")]
    ExitStatus(String),

    #[error("Classifier output malformed: {0}")]
    MalformedOutput(String),

    #[error("Classifier timed out after {0} ms")]
    Timeout(u64),

    #[error("Classification cancelled")]
    Cancelled,

    #[error("Classifier I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
