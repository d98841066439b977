use super::yaml::YamlConfig;
use super::{ClientConfig, ConfigError, env};

/// Merge environment configuration (base) with optional YAML overrides.
///
/// Any value present in the YAML file wins over the environment.
pub(super) fn merge_config(yaml: Option<YamlConfig>) -> Result<ClientConfig, ConfigError> {
    let mut config = env::load_from_env()?;
    let Some(yaml) = yaml else {
        return Ok(config);
    };

    if let Some(endpoint) = yaml.endpoint {
        if endpoint.url.is_some() {
            config.endpoint_url = endpoint.url;
        }
        if let Some(base_url) = endpoint.base_url {
            config.base_url = base_url;
        }
        if let Some(model) = endpoint.model {
            config.model = model;
        }
        if let Some(encoding) = endpoint.encoding {
            config.encoding = encoding;
        }
        if endpoint.auth_token.is_some() {
            config.auth_token = endpoint.auth_token;
        }
        if let Some(scheme) = endpoint.auth_scheme {
            config.auth_scheme = env::parse_auth_scheme("endpoint.auth_scheme", &scheme)?;
        }
    }

    if let Some(audio) = yaml.audio {
        if let Some(rate) = audio.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(channels) = audio.channels {
            config.channels = channels;
        }
        if let Some(chunk_size) = audio.chunk_size {
            config.chunk_size = chunk_size;
        }
        if audio.output_device.is_some() {
            config.output_device = audio.output_device;
        }
    }

    if let Some(timing) = yaml.timing {
        if let Some(ms) = timing.poll_interval_ms {
            config.poll_interval_ms = ms;
        }
        if let Some(ms) = timing.receive_timeout_ms {
            config.receive_timeout_ms = ms;
        }
        if let Some(ms) = timing.connect_timeout_ms {
            config.connect_timeout_ms = ms;
        }
        if let Some(ms) = timing.playback_join_timeout_ms {
            config.playback_join_timeout_ms = ms;
        }
        if let Some(ms) = timing.receiver_join_timeout_ms {
            config.receiver_join_timeout_ms = ms;
        }
        if let Some(ms) = timing.settle_timeout_ms {
            config.settle_timeout_ms = ms;
        }
        if let Some(ms) = timing.clear_ack_timeout_ms {
            config.clear_ack_timeout_ms = ms;
        }
        if let Some(ms) = timing.linger_ms {
            config.linger_ms = ms;
        }
    }

    if let Some(playback) = yaml.playback {
        if let Some(allow) = playback.allow_degraded {
            config.allow_degraded_playback = allow;
        }
        if let Some(cap) = playback.max_buffered_chunks {
            config.max_buffered_chunks = (cap > 0).then_some(cap);
        }
    }

    Ok(config)
}
