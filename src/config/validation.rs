//! Configuration validation logic

use url::Url;

use super::ServerConfig;

/// Validate the final merged configuration.
///
/// Catches misconfiguration at startup instead of at first session.
pub fn validate(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let url = Url::parse(&config.upstream_url)
        .map_err(|e| format!("Invalid UPSTREAM_URL '{}': {e}", config.upstream_url))?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(format!(
            "UPSTREAM_URL must be a ws:// or wss:// URL, got '{}'",
            config.upstream_url
        )
        .into());
    }

    if config.reconnect_base_delay > config.reconnect_max_delay {
        return Err("RECONNECT_BASE_DELAY_MS must not exceed RECONNECT_MAX_DELAY_MS".into());
    }

    if !(0.0..=1.0).contains(&config.vad_threshold) {
        return Err(format!(
            "VAD_THRESHOLD must be within 0.0..=1.0, got {}",
            config.vad_threshold
        )
        .into());
    }

    if config.vad_window_frames == 0 {
        return Err("VAD_WINDOW_FRAMES must be at least 1".into());
    }

    if config.reorder_window == 0 {
        return Err("REORDER_WINDOW must be at least 1".into());
    }

    if config.send_queue_frames == 0 {
        return Err("SEND_QUEUE_FRAMES must be at least 1".into());
    }

    if config.upstream_api_key.is_none() {
        tracing::warn!("UPSTREAM_API_KEY is not set; upstream sessions will fail to authenticate");
    }

    Ok(())
}
