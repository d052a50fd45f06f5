//! Application configuration
//!
//! Loaded from TOML. Every section has defaults so a partial file (or none
//! at all) yields a working viewer pointed at the default device port.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{Error, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "CAMLINK_CONFIG";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub audio: AudioConfig,
    pub video: VideoConfig,
    pub inference: InferenceConfig,
    pub uplink: UplinkConfig,
    pub ui: UiConfig,
}

/// How media is laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolProfile {
    /// One connection, each packet carries a video and an audio payload
    Multiplexed,
    /// Separate video and audio connections, each length-prefixed
    SplitChannels,
}

/// Byte order of 16-bit PCM on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcmEndian {
    Little,
    Big,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub profile: ProtocolProfile,
    /// Capture device host name or address
    pub device_host: String,
    /// Multiplexed stream port
    pub media_port: u16,
    /// Split-channel video port
    pub video_port: u16,
    /// Split-channel audio port
    pub audio_port: u16,
    /// Expect a sample-rate preamble on the split audio channel
    pub sample_rate_preamble: bool,
    pub uplink_port: u16,
    pub connect_timeout_ms: u64,
    /// Pause before the viewer reconnects after a connection ends
    pub reconnect_delay_ms: u64,
    pub read_chunk_size: usize,
    /// Largest payload a header may declare before the stream is rejected
    pub max_payload_size: u32,
    pub tcp_nodelay: bool,
    pub recv_buffer_size: Option<usize>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            profile: ProtocolProfile::Multiplexed,
            device_host: "127.0.0.1".to_string(),
            media_port: DEFAULT_MEDIA_PORT,
            video_port: 5001,
            audio_port: 5002,
            sample_rate_preamble: true,
            uplink_port: DEFAULT_UPLINK_PORT,
            connect_timeout_ms: 5_000,
            reconnect_delay_ms: 2_000,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            tcp_nodelay: true,
            recv_buffer_size: Some(256 * 1024),
        }
    }
}

impl NetworkConfig {
    pub fn media_addr(&self) -> String {
        format!("{}:{}", self.device_host, self.media_port)
    }

    pub fn video_addr(&self) -> String {
        format!("{}:{}", self.device_host, self.video_port)
    }

    pub fn audio_addr(&self) -> String {
        format!("{}:{}", self.device_host, self.audio_port)
    }

    pub fn uplink_addr(&self) -> String {
        format!("{}:{}", self.device_host, self.uplink_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Stream sample rate; fixed for the life of a connection
    pub sample_rate: u32,
    pub pcm_endian: PcmEndian,
    /// Buffered audio beyond this is dropped oldest-first
    pub high_water_ms: u32,
    /// Output device name; `None` uses the host default
    pub output_device: Option<String>,
    /// Requested output callback size in frames
    pub output_block: Option<u32>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            pcm_endian: PcmEndian::Little,
            high_water_ms: DEFAULT_HIGH_WATER_MS,
            output_device: None,
            output_block: Some(512),
        }
    }
}

impl AudioConfig {
    /// High-water mark in samples at the configured rate
    pub fn high_water_samples(&self) -> usize {
        high_water_samples(self.sample_rate, self.high_water_ms)
    }
}

/// Convert a buffering duration to a sample count, never less than one
pub fn high_water_samples(sample_rate: u32, high_water_ms: u32) -> usize {
    ((sample_rate as u64 * high_water_ms as u64) / 1000).max(1) as usize
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Decode on a dedicated worker so slow decode skips stale frames
    pub decode_worker: bool,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            decode_worker: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub enabled: bool,
    /// Minimum interval between classifier dispatches
    pub min_interval_ms: u64,
    /// Labels (case-insensitive substrings) that raise a detection
    pub keywords: Vec<String>,
    pub min_score: f32,
    /// External classifier program and arguments
    pub command: Vec<String>,
    /// A classifier run taking longer than this is killed
    pub timeout_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_interval_ms: DEFAULT_INFERENCE_INTERVAL_MS,
            keywords: vec!["person".to_string()],
            min_score: 0.5,
            command: Vec::new(),
            timeout_ms: DEFAULT_CLASSIFIER_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub enabled: bool,
    /// Input device name; `None` uses the host default
    pub input_device: Option<String>,
    pub sample_rate: u32,
    pub pcm_endian: PcmEndian,
    /// Samples per sent packet
    pub block_size: usize,
    /// Packets allowed in flight before blocks are dropped
    pub send_queue_depth: usize,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            input_device: None,
            sample_rate: 44_100,
            pcm_endian: PcmEndian::Little,
            block_size: DEFAULT_CAPTURE_BLOCK,
            send_queue_depth: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl UiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.http_port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid UI bind address: {}", e)))
    }
}

impl AppConfig {
    /// Default config file location for this user
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "camlink").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Parse a config from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Resolve the config: explicit path, then `CAMLINK_CONFIG`, then the
    /// per-user file, then defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        match Self::default_path() {
            Some(path) if path.is_file() => {
                tracing::info!("Loading config from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Write the config as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 || self.uplink.sample_rate == 0 {
            return Err(Error::Config("sample rate must be non-zero".into()));
        }
        if self.network.max_payload_size == 0 {
            return Err(Error::Config("max_payload_size must be non-zero".into()));
        }
        if self.network.read_chunk_size == 0 {
            return Err(Error::Config("read_chunk_size must be non-zero".into()));
        }
        if self.inference.min_interval_ms == 0 {
            return Err(Error::Config("inference.min_interval_ms must be non-zero".into()));
        }
        if self.inference.timeout_ms == 0 {
            return Err(Error::Config("inference.timeout_ms must be non-zero".into()));
        }
        if self.inference.enabled && self.inference.command.is_empty() {
            return Err(Error::Config("inference enabled without a command".into()));
        }
        let block = self.audio.output_block.unwrap_or(0) as usize;
        if self.audio.high_water_samples() < block {
            return Err(Error::Config(format!(
                "high_water_ms {} holds fewer samples than one output block ({})",
                self.audio.high_water_ms, block
            )));
        }
        if self.uplink.block_size == 0 || self.uplink.send_queue_depth == 0 {
            return Err(Error::Config("uplink block_size and send_queue_depth must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio.sample_rate, 16_000);
        assert_eq!(config.network.profile, ProtocolProfile::Multiplexed);
        assert_eq!(config.audio.high_water_samples(), 8_000);
    }

    #[test]
    fn test_partial_toml() {
        let config = AppConfig::from_toml(
            r#"
            [network]
            device_host = "192.168.10.59"
            profile = "split_channels"

            [audio]
            sample_rate = 44100
            pcm_endian = "big"
            "#,
        )
        .unwrap();

        assert_eq!(config.network.device_host, "192.168.10.59");
        assert_eq!(config.network.profile, ProtocolProfile::SplitChannels);
        assert_eq!(config.network.media_addr(), "192.168.10.59:65434");
        assert_eq!(config.audio.pcm_endian, PcmEndian::Big);
        assert_eq!(config.inference.min_interval_ms, 3_000);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(AppConfig::from_toml("[audio]\nsample_rate = 0\n").is_err());
        assert!(AppConfig::from_toml("[network]\nmax_payload_size = 0\n").is_err());
        assert!(AppConfig::from_toml("[inference]\nenabled = true\n").is_err());
        assert!(AppConfig::from_toml("[inference]\ntimeout_ms = 0\n").is_err());
        assert!(AppConfig::from_toml("[audio]\nhigh_water_ms = 1\noutput_block = 512\n").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("camlink-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");

        let mut config = AppConfig::default();
        config.inference.keywords = vec!["dog".into(), "cat".into()];
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.inference.keywords, vec!["dog", "cat"]);

        std::fs::remove_dir_all(dir).unwrap();
    }
}
