use std::env;
use std::path::PathBuf;
use std::time::Duration;

use super::utils::{env_f32, env_u64};
use super::validation::validate;
use super::{ServerConfig, TurnDetectionMode};

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// Reads configuration from environment variables, with sensible defaults.
    /// Also loads from .env file if present using dotenvy.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Numeric environment variables are malformed
    /// - `TURN_DETECTION` names an unknown mode
    /// - Validation of the final configuration fails
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let defaults = ServerConfig::default();

        // Server configuration
        let host = env::var("HOST").unwrap_or(defaults.host);
        let port = env::var("PORT")
            .unwrap_or_else(|_| defaults.port.to_string())
            .parse::<u16>()
            .map_err(|e| format!("Invalid port number: {e}"))?;

        // Upstream speech API
        let upstream_url = env::var("UPSTREAM_URL").unwrap_or(defaults.upstream_url);
        let upstream_model = env::var("UPSTREAM_MODEL").unwrap_or(defaults.upstream_model);
        let upstream_api_key = env::var("UPSTREAM_API_KEY").ok();
        let upstream_voice = env::var("UPSTREAM_VOICE").unwrap_or(defaults.upstream_voice);
        let upstream_instructions =
            env::var("UPSTREAM_INSTRUCTIONS").unwrap_or(defaults.upstream_instructions);

        // Connection lifecycle
        let connect_timeout = Duration::from_secs(env_u64(
            "CONNECT_TIMEOUT_SECS",
            defaults.connect_timeout.as_secs(),
        ));
        let heartbeat_interval = Duration::from_secs(env_u64(
            "HEARTBEAT_INTERVAL_SECS",
            defaults.heartbeat_interval.as_secs(),
        ));
        let reconnect_max_attempts = env_u64(
            "RECONNECT_MAX_ATTEMPTS",
            defaults.reconnect_max_attempts as u64,
        ) as u32;
        let reconnect_base_delay = Duration::from_millis(env_u64(
            "RECONNECT_BASE_DELAY_MS",
            defaults.reconnect_base_delay.as_millis() as u64,
        ));
        let reconnect_max_delay = Duration::from_millis(env_u64(
            "RECONNECT_MAX_DELAY_MS",
            defaults.reconnect_max_delay.as_millis() as u64,
        ));

        // Session lifecycle
        let session_idle_timeout = Duration::from_secs(env_u64(
            "SESSION_IDLE_TIMEOUT_SECS",
            defaults.session_idle_timeout.as_secs(),
        ));
        let session_reaper_interval = Duration::from_secs(env_u64(
            "SESSION_REAPER_INTERVAL_SECS",
            defaults.session_reaper_interval.as_secs(),
        ));
        let stream_idle_timeout = Duration::from_secs(env_u64(
            "STREAM_IDLE_TIMEOUT_SECS",
            defaults.stream_idle_timeout.as_secs(),
        ));
        let stream_sweep_interval = Duration::from_secs(env_u64(
            "STREAM_SWEEP_INTERVAL_SECS",
            defaults.stream_sweep_interval.as_secs(),
        ));

        // Audio pipeline
        let turn_detection = match env::var("TURN_DETECTION") {
            Ok(value) => TurnDetectionMode::parse(&value)
                .ok_or_else(|| format!("Invalid TURN_DETECTION '{value}' (server|local)"))?,
            Err(_) => defaults.turn_detection,
        };
        let vad_threshold = env_f32("VAD_THRESHOLD", defaults.vad_threshold);
        let vad_window_frames =
            env_u64("VAD_WINDOW_FRAMES", defaults.vad_window_frames as u64) as usize;
        let vad_silence_frames =
            env_u64("VAD_SILENCE_FRAMES", defaults.vad_silence_frames as u64) as u32;
        let reorder_window = env_u64("REORDER_WINDOW", defaults.reorder_window);
        let send_queue_frames =
            env_u64("SEND_QUEUE_FRAMES", defaults.send_queue_frames as u64) as usize;

        // Order extraction
        let default_tenant = env::var("DEFAULT_TENANT").unwrap_or(defaults.default_tenant);
        let menu_path = env::var("MENU_PATH").ok().map(PathBuf::from);
        let free_text_cap = env_u64("FREE_TEXT_CAP", defaults.free_text_cap as u64) as usize;

        let config = Self {
            host,
            port,
            upstream_url,
            upstream_model,
            upstream_api_key,
            upstream_voice,
            upstream_instructions,
            connect_timeout,
            heartbeat_interval,
            reconnect_max_attempts,
            reconnect_base_delay,
            reconnect_max_delay,
            session_idle_timeout,
            session_reaper_interval,
            stream_idle_timeout,
            stream_sweep_interval,
            turn_detection,
            vad_threshold,
            vad_window_frames,
            vad_silence_frames,
            reorder_window,
            send_queue_frames,
            default_tenant,
            menu_path,
            free_text_cap,
        };

        validate(&config)?;
        Ok(config)
    }
}
