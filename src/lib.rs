//! # Camlink
//!
//! Live video and audio from a networked capture device, with microphone
//! talk-back in the other direction.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                 VIEWER                                     │
//! │  ┌────────────────────────────────────────────────────────────────────┐  │
//! │  │        TCP Transport (network::transport) - one per channel         │  │
//! │  │   Packets: [videoSize u32 BE|audioSize u32 BE|JPEG|PCM s16]         │  │
//! │  └──────────────────────────────┬─────────────────────────────────────┘  │
//! │                                 ▼                                         │
//! │  ┌────────────────────────────────────────────────────────────────────┐  │
//! │  │      Stream Demultiplexer (network::demux) - pending tail only      │  │
//! │  └───────────────┬──────────────────────────────────┬─────────────────┘  │
//! │                  │ video payload                    │ audio payload       │
//! │                  ▼                                  ▼                     │
//! │  ┌──────────────────────────┐        ┌──────────────────────────────┐    │
//! │  │ Video Decode Worker      │        │ Jitter Buffer (audio::buffer)│    │
//! │  │ latest-wins pending slot │        │ fixed-capacity sample ring   │    │
//! │  └──────┬────────────┬──────┘        └───────────────┬──────────────┘    │
//! │         │            │                               │ pull_block(n)      │
//! │         ▼            ▼                               ▼                    │
//! │  ┌────────────┐ ┌──────────────────┐        ┌──────────────────────┐     │
//! │  │ Frame slot │ │ Inference        │        │ cpal output callback │     │
//! │  │ (watch)    │ │ Throttle → worker│        │ (real-time thread)   │     │
//! │  └─────┬──────┘ └────────┬─────────┘        └──────────────────────┘     │
//! │        ▼                 ▼                                                │
//! │   /frame.jpg      DetectionEvent → /ws/detections                         │
//! │                                                                           │
//! │  ┌────────────────────────────────────────────────────────────────────┐  │
//! │  │ Uplink: cpal capture → PCM s16 → audio-only packet → writer queue   │  │
//! │  └────────────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod inference;
pub mod network;
pub mod pipeline;
pub mod ui;
pub mod video;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default PCM sample rate of the downlink audio stream
    pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

    /// Lowest sample rate accepted from a preamble
    pub const MIN_SAMPLE_RATE: u32 = 8_000;

    /// Highest sample rate accepted from a preamble
    pub const MAX_SAMPLE_RATE: u32 = 192_000;

    /// Default TCP port of the multiplexed media stream
    pub const DEFAULT_MEDIA_PORT: u16 = 65434;

    /// Default TCP port of the talk-back channel
    pub const DEFAULT_UPLINK_PORT: u16 = 5003;

    /// Default HTTP port for the local render surface
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    /// Multiplexed packet header: two big-endian u32 sizes
    pub const PACKET_HEADER_SIZE: usize = 8;

    /// Split-channel frame header: one big-endian u32 size
    pub const FRAME_HEADER_SIZE: usize = 4;

    /// Default per-payload size limit (4 MiB)
    pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 4 * 1024 * 1024;

    /// Default audio buffering ceiling before oldest samples are dropped
    pub const DEFAULT_HIGH_WATER_MS: u32 = 500;

    /// Default minimum interval between classifier dispatches
    pub const DEFAULT_INFERENCE_INTERVAL_MS: u64 = 3_000;

    /// Default limit on one classifier run before it is killed
    pub const DEFAULT_CLASSIFIER_TIMEOUT_MS: u64 = 10_000;

    /// Default capture block size for talk-back, in samples
    pub const DEFAULT_CAPTURE_BLOCK: usize = 1024;

    /// Size of each socket read handed to the demultiplexer
    pub const DEFAULT_READ_CHUNK_SIZE: usize = 16 * 1024;
}
