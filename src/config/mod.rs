//! Configuration for the speaker client
//!
//! This module loads client configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use waav_speaker::config::ClientConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ClientConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config = ClientConfig::from_file(&PathBuf::from("speaker.yaml"))?;
//!
//! println!("Synthesis endpoint: {}", config.endpoint_url()?);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::core::playback::{AudioFormat, DEFAULT_CHANNELS, DEFAULT_CHUNK_SIZE, DEFAULT_SAMPLE_RATE};
use crate::core::synthesis::{AuthScheme, ConnectionOptions};

mod env;
mod merge;
mod validation;
mod yaml;

pub use yaml::{AudioYaml, EndpointYaml, PlaybackYaml, TimingYaml, YamlConfig};

/// Default synthesis endpoint (without query parameters).
pub const DEFAULT_BASE_URL: &str = "wss://api.deepgram.com/v1/speak";

/// Default voice model.
pub const DEFAULT_MODEL: &str = "aura-asteria-en";

/// Default audio encoding requested from the service.
pub const DEFAULT_ENCODING: &str = "linear16";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error(
        "No auth token configured: set WAAV_TTS_TOKEN or DEEPGRAM_API_KEY, or endpoint.auth_token in the config file"
    )]
    MissingToken,
}

impl ConfigError {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Client configuration
#[derive(Clone)]
pub struct ClientConfig {
    // Endpoint
    /// Full endpoint URL. When set, `base_url`, `model`, `encoding` and
    /// `sample_rate` are not added to it.
    pub endpoint_url: Option<String>,
    pub base_url: String,
    pub model: String,
    pub encoding: String,
    /// Zeroized on drop, never printed.
    pub auth_token: Option<String>,
    pub auth_scheme: AuthScheme,

    // Audio
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_size: usize,
    /// Output device name; `None` uses the host default.
    pub output_device: Option<String>,

    // Timing (milliseconds)
    /// Drain loop wait on an empty buffer. Default: 50
    pub poll_interval_ms: u64,
    /// Receiver wait per `receive`. Default: 100
    pub receive_timeout_ms: u64,
    /// WebSocket handshake bound. Default: 10000
    pub connect_timeout_ms: u64,
    /// Drain thread join bound. Default: 1000
    pub playback_join_timeout_ms: u64,
    /// Receiver task join bound. Default: 2000
    pub receiver_join_timeout_ms: u64,
    /// How long `speak` waits for an in-flight chunk of the previous
    /// utterance to be released. Default: 100
    pub settle_timeout_ms: u64,
    /// How long incoming audio is discarded after a barge-in while waiting
    /// for the service to acknowledge the Clear. 0 disables the wait.
    /// Default: 1000
    pub clear_ack_timeout_ms: u64,
    /// How long the `say` command keeps the session open after playback
    /// goes quiet. Default: 1500
    pub linger_ms: u64,

    // Playback policy
    /// Keep the session running when the output device cannot be opened.
    /// Default: false
    pub allow_degraded_playback: bool,
    /// Soft cap on buffered chunks (drop-oldest). Default: None (unbounded)
    pub max_buffered_chunks: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            encoding: DEFAULT_ENCODING.to_string(),
            auth_token: None,
            auth_scheme: AuthScheme::Token,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            output_device: None,
            poll_interval_ms: 50,
            receive_timeout_ms: 100,
            connect_timeout_ms: 10_000,
            playback_join_timeout_ms: 1_000,
            receiver_join_timeout_ms: 2_000,
            settle_timeout_ms: 100,
            clear_ack_timeout_ms: 1_000,
            linger_ms: 1_500,
            allow_degraded_playback: false,
            max_buffered_chunks: None,
        }
    }
}

/// Implement Drop to zeroize the auth token when the config is dropped.
impl Drop for ClientConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut token) = self.auth_token {
            token.zeroize();
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("encoding", &self.encoding)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("auth_scheme", &self.auth_scheme)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("chunk_size", &self.chunk_size)
            .field("output_device", &self.output_device)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("receive_timeout_ms", &self.receive_timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("playback_join_timeout_ms", &self.playback_join_timeout_ms)
            .field("receiver_join_timeout_ms", &self.receiver_join_timeout_ms)
            .field("settle_timeout_ms", &self.settle_timeout_ms)
            .field("clear_ack_timeout_ms", &self.clear_ack_timeout_ms)
            .field("linger_ms", &self.linger_ms)
            .field("allow_degraded_playback", &self.allow_degraded_playback)
            .field("max_buffered_chunks", &self.max_buffered_chunks)
            .finish()
    }
}

impl ClientConfig {
    /// Load configuration from environment variables over defaults.
    ///
    /// The .env file is loaded in `main` before this is called.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = merge::merge_config(None)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// The URL to connect to.
    ///
    /// An explicit `endpoint_url` is used as-is. Otherwise the query
    /// parameters `encoding`, `sample_rate` and `model` are appended to
    /// `base_url`:
    ///
    /// ```text
    /// wss://api.deepgram.com/v1/speak?encoding=linear16&sample_rate=48000&model=aura-asteria-en
    /// ```
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        if let Some(explicit) = self.endpoint_url.as_deref() {
            return validation::parse_ws_url(explicit);
        }

        let mut url = validation::parse_ws_url(&self.base_url)?;
        url.query_pairs_mut()
            .append_pair("encoding", &self.encoding)
            .append_pair("sample_rate", &self.sample_rate.to_string())
            .append_pair("model", &self.model);
        Ok(url)
    }

    /// The auth token, or `MissingToken` when none is configured.
    pub fn require_auth_token(&self) -> Result<&str, ConfigError> {
        self.auth_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or(ConfigError::MissingToken)
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            chunk_size: self.chunk_size,
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            auth_scheme: self.auth_scheme,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn playback_join_timeout(&self) -> Duration {
        Duration::from_millis(self.playback_join_timeout_ms)
    }

    pub fn receiver_join_timeout(&self) -> Duration {
        Duration::from_millis(self.receiver_join_timeout_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn clear_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.clear_ack_timeout_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn cleanup_env_vars() {
        unsafe {
            for name in super::env::ENV_VARS {
                env::remove_var(name);
            }
        }
    }

    #[test]
    fn test_default_endpoint_url() {
        let config = ClientConfig::default();
        assert_eq!(
            config.endpoint_url().unwrap().as_str(),
            "wss://api.deepgram.com/v1/speak?encoding=linear16&sample_rate=48000&model=aura-asteria-en"
        );
    }

    #[test]
    fn test_explicit_endpoint_url_is_used_verbatim() {
        let mut config = ClientConfig::default();
        config.endpoint_url = Some("ws://127.0.0.1:9000/v1/speak?model=custom".to_string());
        assert_eq!(
            config.endpoint_url().unwrap().as_str(),
            "ws://127.0.0.1:9000/v1/speak?model=custom"
        );
    }

    #[test]
    fn test_endpoint_url_rejects_http_scheme() {
        let mut config = ClientConfig::default();
        config.base_url = "https://api.deepgram.com/v1/speak".to_string();
        assert!(matches!(
            config.endpoint_url(),
            Err(ConfigError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_require_auth_token() {
        let mut config = ClientConfig::default();
        assert!(matches!(
            config.require_auth_token(),
            Err(ConfigError::MissingToken)
        ));

        config.auth_token = Some("   ".to_string());
        assert!(config.require_auth_token().is_err());

        config.auth_token = Some("dg-key".to_string());
        assert_eq!(config.require_auth_token().unwrap(), "dg-key");
    }

    #[test]
    fn test_debug_redacts_token() {
        let mut config = ClientConfig::default();
        config.auth_token = Some("super-secret".to_string());
        let printed = format!("{config:?}");
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_derived_settings() {
        let mut config = ClientConfig::default();
        config.auth_scheme = AuthScheme::Bearer;
        config.connect_timeout_ms = 250;
        assert_eq!(config.audio_format(), AudioFormat::default());
        assert_eq!(config.connection_options().auth_scheme, AuthScheme::Bearer);
        assert_eq!(
            config.connection_options().connect_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(config.receive_timeout(), Duration::from_millis(100));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        cleanup_env_vars();

        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.sample_rate, 48_000);
        assert!(config.auth_token.is_none());
        assert!(!config.allow_degraded_playback);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_values() {
        cleanup_env_vars();

        unsafe {
            env::set_var("WAAV_TTS_MODEL", "aura-luna-en");
            env::set_var("DEEPGRAM_API_KEY", "dg-env-key");
            env::set_var("WAAV_TTS_AUTH_SCHEME", "bearer");
            env::set_var("WAAV_SAMPLE_RATE", "24000");
            env::set_var("WAAV_ALLOW_DEGRADED_PLAYBACK", "true");
            env::set_var("WAAV_MAX_BUFFERED_CHUNKS", "64");
        }

        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.model, "aura-luna-en");
        assert_eq!(config.auth_token.as_deref(), Some("dg-env-key"));
        assert_eq!(config.auth_scheme, AuthScheme::Bearer);
        assert_eq!(config.sample_rate, 24_000);
        assert!(config.allow_degraded_playback);
        assert_eq!(config.max_buffered_chunks, Some(64));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_waav_token_takes_precedence_over_deepgram_key() {
        cleanup_env_vars();

        unsafe {
            env::set_var("WAAV_TTS_TOKEN", "waav-key");
            env::set_var("DEEPGRAM_API_KEY", "dg-key");
        }

        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.auth_token.as_deref(), Some("waav-key"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_number() {
        cleanup_env_vars();

        unsafe {
            env::set_var("WAAV_SAMPLE_RATE", "fast");
        }

        let result = ClientConfig::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref name, .. }) if name == "WAAV_SAMPLE_RATE"
        ));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_only() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("speaker.yaml");

        let yaml_content = r#"
endpoint:
  model: "aura-orion-en"
  auth_token: "yaml-key"

audio:
  sample_rate: 24000
  output_device: "USB Speaker"

timing:
  settle_timeout_ms: 250
  clear_ack_timeout_ms: 0

playback:
  allow_degraded: true
"#;

        fs::write(&config_path, yaml_content).unwrap();

        let config = ClientConfig::from_file(&config_path).unwrap();

        assert_eq!(config.model, "aura-orion-en");
        assert_eq!(config.auth_token.as_deref(), Some("yaml-key"));
        assert_eq!(config.sample_rate, 24_000);
        assert_eq!(config.output_device.as_deref(), Some("USB Speaker"));
        assert_eq!(config.settle_timeout_ms, 250);
        assert_eq!(config.clear_ack_timeout(), Duration::ZERO);
        assert!(config.allow_degraded_playback);
        assert_eq!(
            config.endpoint_url().unwrap().as_str(),
            "wss://api.deepgram.com/v1/speak?encoding=linear16&sample_rate=24000&model=aura-orion-en"
        );

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("speaker.yaml");

        fs::write(
            &config_path,
            r#"
endpoint:
  auth_token: "yaml-key"
"#,
        )
        .unwrap();

        unsafe {
            env::set_var("DEEPGRAM_API_KEY", "env-key");
            env::set_var("WAAV_TTS_MODEL", "aura-luna-en");
        }

        let config = ClientConfig::from_file(&config_path).unwrap();

        // YAML overrides ENV
        assert_eq!(config.auth_token.as_deref(), Some("yaml-key"));
        // ENV value where YAML is silent
        assert_eq!(config.model, "aura-luna-en");

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();

        let config_path = PathBuf::from("/nonexistent/speaker.yaml");
        let result = ClientConfig::from_file(&config_path);

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_invalid_values_fail_validation() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("speaker.yaml");
        fs::write(&config_path, "audio:\n  channels: 0\n").unwrap();

        let result = ClientConfig::from_file(&config_path);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref name, .. }) if name == "channels"
        ));

        cleanup_env_vars();
    }
}
