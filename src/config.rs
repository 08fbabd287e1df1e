//! Client configuration
//!
//! Loaded from a TOML file; every section falls back to defaults so a
//! partial file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub audio: AudioConfig,
    pub transport: TransportConfig,
    pub recording: RecordingConfig,
}

/// Device and block-size settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Session sample rate, shared by capture, render and the wire
    pub sample_rate: u32,

    /// Samples per transmitted capture block
    pub capture_block_size: usize,

    /// Samples per playback frame (one render tick)
    pub render_block_size: usize,

    /// Upper bound on queued agent audio before the oldest frames are dropped
    pub max_buffered_secs: f32,

    /// Input device name, system default when unset
    pub input_device: Option<String>,

    /// Output device name, system default when unset
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            capture_block_size: DEFAULT_CAPTURE_BLOCK,
            render_block_size: DEFAULT_RENDER_BLOCK,
            max_buffered_secs: DEFAULT_MAX_BUFFERED_SECS,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    /// Playback queue capacity in frames
    pub fn queue_capacity(&self) -> usize {
        let samples = (self.max_buffered_secs.max(0.0) * self.sample_rate as f32) as usize;
        (samples / self.render_block_size.max(1)).max(1)
    }
}

/// Remote agent connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Base WebSocket URL (`ws://` or `wss://`)
    pub url: String,

    /// Client identifier appended to the endpoint path
    pub client_id: String,

    /// Idle time after the last agent chunk before `ai_speak_stop` is sent
    pub speak_stop_delay_ms: u64,

    pub connect_timeout_ms: u64,

    /// How long an offset/interrupt query waits for the renderer
    pub query_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_AGENT_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            speak_stop_delay_ms: DEFAULT_SPEAK_STOP_MS,
            connect_timeout_ms: 10_000,
            query_timeout_ms: 1_000,
        }
    }
}

impl TransportConfig {
    /// Full WebSocket endpoint for this client
    pub fn endpoint(&self) -> String {
        format!("{}/ws/user/{}", self.url.trim_end_matches('/'), self.client_id)
    }
}

/// Recording settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub enabled: bool,

    /// Where the CLI writes WAV files on stop
    pub output_dir: Option<PathBuf>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: ClientConfig =
            toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is missing
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Write configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Platform config location (`.../voice-client/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "langcore", "voice-client")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be non-zero".into()));
        }
        if audio.capture_block_size == 0 || audio.render_block_size == 0 {
            return Err(Error::Config("block sizes must be non-zero".into()));
        }
        if audio.render_block_size > MAX_RENDER_BLOCK {
            return Err(Error::Config(format!(
                "render_block_size {} exceeds {}",
                audio.render_block_size, MAX_RENDER_BLOCK
            )));
        }
        if audio.max_buffered_secs.is_nan() || audio.max_buffered_secs <= 0.0 {
            return Err(Error::Config("max_buffered_secs must be positive".into()));
        }
        let url = &self.transport.url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::Config(format!("transport url must be ws:// or wss://, got {url}")));
        }
        Ok(())
    }
}
