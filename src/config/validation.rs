use url::Url;

use super::{ClientConfig, ConfigError};

/// Check the merged configuration for values that cannot work.
///
/// The auth token is not required here; it is checked when a session is
/// initialised from the configuration.
pub(super) fn validate(config: &ClientConfig) -> Result<(), ConfigError> {
    // Resolves and checks both the explicit URL and the built one.
    config.endpoint_url()?;

    if config.model.trim().is_empty() {
        return Err(ConfigError::invalid("model", "must not be empty"));
    }
    if config.sample_rate == 0 {
        return Err(ConfigError::invalid("sample_rate", "must be greater than 0"));
    }
    if config.channels == 0 {
        return Err(ConfigError::invalid("channels", "must be greater than 0"));
    }
    if config.chunk_size == 0 || config.chunk_size % 2 != 0 {
        return Err(ConfigError::invalid(
            "chunk_size",
            "must be a positive, even number of bytes",
        ));
    }

    for (name, value) in [
        ("poll_interval_ms", config.poll_interval_ms),
        ("receive_timeout_ms", config.receive_timeout_ms),
        ("connect_timeout_ms", config.connect_timeout_ms),
        ("playback_join_timeout_ms", config.playback_join_timeout_ms),
        ("receiver_join_timeout_ms", config.receiver_join_timeout_ms),
    ] {
        if value == 0 {
            return Err(ConfigError::invalid(name, "must be greater than 0"));
        }
    }

    Ok(())
}

/// Parse a WebSocket URL, rejecting anything that is not `ws` or `wss`.
pub(super) fn parse_ws_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(format!("'{raw}': {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::InvalidUrl(format!(
            "'{raw}': scheme must be ws or wss, got {other}"
        ))),
    }
}
