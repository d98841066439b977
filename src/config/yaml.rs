use serde::Deserialize;
use std::path::Path;

use super::ConfigError;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present
/// here override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// endpoint:
///   url: "wss://api.deepgram.com/v1/speak?model=aura-asteria-en"  # overrides the fields below
///   base_url: "wss://api.deepgram.com/v1/speak"
///   model: "aura-asteria-en"
///   encoding: "linear16"
///   auth_token: "your-deepgram-key"
///   auth_scheme: "token"          # or "bearer"
///
/// audio:
///   sample_rate: 48000
///   channels: 1
///   chunk_size: 8000
///   output_device: "USB Speaker"
///
/// timing:
///   poll_interval_ms: 50
///   receive_timeout_ms: 100
///   connect_timeout_ms: 10000
///   playback_join_timeout_ms: 1000
///   receiver_join_timeout_ms: 2000
///   settle_timeout_ms: 100
///   clear_ack_timeout_ms: 1000
///   linger_ms: 1500
///
/// playback:
///   allow_degraded: false
///   max_buffered_chunks: 256
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub endpoint: Option<EndpointYaml>,
    pub audio: Option<AudioYaml>,
    pub timing: Option<TimingYaml>,
    pub playback: Option<PlaybackYaml>,
}

/// Synthesis endpoint and credentials from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EndpointYaml {
    pub url: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub encoding: Option<String>,
    pub auth_token: Option<String>,
    /// "token" or "bearer"
    pub auth_scheme: Option<String>,
}

/// Output format and device from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub chunk_size: Option<usize>,
    pub output_device: Option<String>,
}

/// Timeouts and poll intervals from YAML, all in milliseconds
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TimingYaml {
    pub poll_interval_ms: Option<u64>,
    pub receive_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub playback_join_timeout_ms: Option<u64>,
    pub receiver_join_timeout_ms: Option<u64>,
    pub settle_timeout_ms: Option<u64>,
    pub clear_ack_timeout_ms: Option<u64>,
    pub linger_ms: Option<u64>,
}

/// Playback policy from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PlaybackYaml {
    pub allow_degraded: Option<bool>,
    /// 0 disables the cap
    pub max_buffered_chunks: Option<usize>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: YamlConfig = serde_yaml::from_str(&contents)?;

        Ok(config)
    }
}
