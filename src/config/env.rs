use std::env;
use std::str::FromStr;

use super::{ClientConfig, ConfigError};
use crate::core::synthesis::AuthScheme;

/// Every variable this module reads.
pub(crate) const ENV_VARS: &[&str] = &[
    "WAAV_TTS_URL",
    "WAAV_TTS_BASE_URL",
    "WAAV_TTS_MODEL",
    "WAAV_TTS_ENCODING",
    "WAAV_TTS_TOKEN",
    "DEEPGRAM_API_KEY",
    "WAAV_TTS_AUTH_SCHEME",
    "WAAV_SAMPLE_RATE",
    "WAAV_CHANNELS",
    "WAAV_CHUNK_SIZE",
    "WAAV_OUTPUT_DEVICE",
    "WAAV_POLL_INTERVAL_MS",
    "WAAV_RECEIVE_TIMEOUT_MS",
    "WAAV_CONNECT_TIMEOUT_MS",
    "WAAV_PLAYBACK_JOIN_TIMEOUT_MS",
    "WAAV_RECEIVER_JOIN_TIMEOUT_MS",
    "WAAV_SETTLE_TIMEOUT_MS",
    "WAAV_CLEAR_ACK_TIMEOUT_MS",
    "WAAV_LINGER_MS",
    "WAAV_ALLOW_DEGRADED_PLAYBACK",
    "WAAV_MAX_BUFFERED_CHUNKS",
];

/// Build a configuration from environment variables over defaults.
pub(super) fn load_from_env() -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig::default();

    // Endpoint
    config.endpoint_url = string_var("WAAV_TTS_URL");
    if let Some(base_url) = string_var("WAAV_TTS_BASE_URL") {
        config.base_url = base_url;
    }
    if let Some(model) = string_var("WAAV_TTS_MODEL") {
        config.model = model;
    }
    if let Some(encoding) = string_var("WAAV_TTS_ENCODING") {
        config.encoding = encoding;
    }
    config.auth_token = string_var("WAAV_TTS_TOKEN").or_else(|| string_var("DEEPGRAM_API_KEY"));
    if let Some(scheme) = string_var("WAAV_TTS_AUTH_SCHEME") {
        config.auth_scheme = parse_auth_scheme("WAAV_TTS_AUTH_SCHEME", &scheme)?;
    }

    // Audio
    if let Some(rate) = parsed_var("WAAV_SAMPLE_RATE")? {
        config.sample_rate = rate;
    }
    if let Some(channels) = parsed_var("WAAV_CHANNELS")? {
        config.channels = channels;
    }
    if let Some(chunk_size) = parsed_var("WAAV_CHUNK_SIZE")? {
        config.chunk_size = chunk_size;
    }
    config.output_device = string_var("WAAV_OUTPUT_DEVICE");

    // Timing
    if let Some(ms) = parsed_var("WAAV_POLL_INTERVAL_MS")? {
        config.poll_interval_ms = ms;
    }
    if let Some(ms) = parsed_var("WAAV_RECEIVE_TIMEOUT_MS")? {
        config.receive_timeout_ms = ms;
    }
    if let Some(ms) = parsed_var("WAAV_CONNECT_TIMEOUT_MS")? {
        config.connect_timeout_ms = ms;
    }
    if let Some(ms) = parsed_var("WAAV_PLAYBACK_JOIN_TIMEOUT_MS")? {
        config.playback_join_timeout_ms = ms;
    }
    if let Some(ms) = parsed_var("WAAV_RECEIVER_JOIN_TIMEOUT_MS")? {
        config.receiver_join_timeout_ms = ms;
    }
    if let Some(ms) = parsed_var("WAAV_SETTLE_TIMEOUT_MS")? {
        config.settle_timeout_ms = ms;
    }
    if let Some(ms) = parsed_var("WAAV_CLEAR_ACK_TIMEOUT_MS")? {
        config.clear_ack_timeout_ms = ms;
    }
    if let Some(ms) = parsed_var("WAAV_LINGER_MS")? {
        config.linger_ms = ms;
    }

    // Playback policy
    if let Some(value) = string_var("WAAV_ALLOW_DEGRADED_PLAYBACK") {
        config.allow_degraded_playback = parse_bool("WAAV_ALLOW_DEGRADED_PLAYBACK", &value)?;
    }
    config.max_buffered_chunks = parsed_var::<usize>("WAAV_MAX_BUFFERED_CHUNKS")?
        .filter(|cap| *cap > 0);

    Ok(config)
}

/// Non-empty value of `name`.
fn string_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parsed_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    string_var(name)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|e| ConfigError::invalid(name, format!("'{value}': {e}")))
        })
        .transpose()
}

pub(super) fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(
            name,
            format!("'{other}' is not a boolean"),
        )),
    }
}

pub(super) fn parse_auth_scheme(name: &str, value: &str) -> Result<AuthScheme, ConfigError> {
    value
        .parse::<AuthScheme>()
        .map_err(|reason| ConfigError::invalid(name, reason))
}
