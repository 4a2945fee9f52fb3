//! Configuration
//!
//! Client configuration loaded from TOML, with defaults for a local backend.

use serde::{Deserialize, Serialize};
use url::Url;

/// Public STUN server used when no ICE servers are configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Overrides the WebSocket base derived from `api_base_url`
    #[serde(default)]
    pub ws_base_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_api_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_history_limit() -> u32 {
    100
}

fn default_max_message_length() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One ICE server entry (STUN only; no relay credentials are used)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
}

/// Voice channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![DEFAULT_STUN_SERVER.to_string()],
    }]
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Opus frame length in milliseconds
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
}

fn default_sample_rate() -> u32 {
    48000
}

fn default_channels() -> u16 {
    1
}

fn default_frame_ms() -> u32 {
    20
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_ms: 20,
        }
    }
}

impl AudioConfig {
    /// Samples per channel in one Opus frame
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

/// Ask AI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            ws_base_url: None,
            token: None,
            history_limit: 100,
            max_message_length: 4096,
            voice: VoiceConfig::default(),
            audio: AudioConfig::default(),
            ai: AiConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parsed REST base URL
    pub fn api_base(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.api_base_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.api_base_url, e)))
    }

    /// WebSocket base URL: the explicit override, or the API base with
    /// `http` mapped to `ws` and `https` to `wss`.
    pub fn ws_base(&self) -> Result<Url, ConfigError> {
        if let Some(raw) = &self.ws_base_url {
            return Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", raw, e)));
        }

        let mut url = self.api_base()?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            "ws" | "wss" => return Ok(url),
            other => {
                return Err(ConfigError::InvalidUrl(format!(
                    "unsupported scheme {} in {}",
                    other, self.api_base_url
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::InvalidUrl(self.api_base_url.clone()))?;
        Ok(url)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}
