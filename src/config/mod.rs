//! Configuration module for the ordervox server
//!
//! Configuration is loaded from environment variables (with `.env` support via
//! dotenvy). Every tunable has a default so the server starts with nothing but
//! an upstream API key set.
//!
//! # Modules
//! - `env`: Environment variable loading
//! - `validation`: Configuration validation logic
//! - `utils`: Utility functions for configuration parsing

use std::path::PathBuf;
use std::time::Duration;

mod env;
mod utils;
mod validation;

/// Which side owns end-of-utterance detection for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDetectionMode {
    /// The upstream API runs its own server-side VAD and commits turns itself.
    Server,
    /// The local energy VAD decides when a turn ends and commits explicitly.
    Local,
}

impl TurnDetectionMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "server" => Some(TurnDetectionMode::Server),
            "local" => Some(TurnDetectionMode::Local),
            _ => None,
        }
    }
}

/// Server configuration
///
/// Contains all configuration needed to run the ordervox bridge:
/// - Server settings (host, port)
/// - Upstream speech API settings (URL, model, key, voice, instructions)
/// - Connection lifecycle tunables (timeouts, heartbeat, reconnect policy)
/// - Session lifecycle tunables (idle timeout, reaper intervals)
/// - Audio pipeline tunables (VAD, reorder window, send queue bound)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // Upstream speech API
    pub upstream_url: String,
    pub upstream_model: String,
    pub upstream_api_key: Option<String>,
    pub upstream_voice: String,
    pub upstream_instructions: String,

    // Connection lifecycle
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,

    // Session lifecycle
    pub session_idle_timeout: Duration,
    pub session_reaper_interval: Duration,
    pub stream_idle_timeout: Duration,
    pub stream_sweep_interval: Duration,

    // Audio pipeline
    pub turn_detection: TurnDetectionMode,
    pub vad_threshold: f32,
    pub vad_window_frames: usize,
    pub vad_silence_frames: u32,
    pub reorder_window: u64,
    pub send_queue_frames: usize,

    // Order extraction
    pub default_tenant: String,
    pub menu_path: Option<PathBuf>,
    pub free_text_cap: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3002,
            upstream_url: "wss://api.openai.com/v1/realtime".to_string(),
            upstream_model: "gpt-realtime".to_string(),
            upstream_api_key: None,
            upstream_voice: "alloy".to_string(),
            upstream_instructions: default_instructions(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_max_attempts: 3,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(10),
            session_idle_timeout: Duration::from_secs(300),
            session_reaper_interval: Duration::from_secs(60),
            stream_idle_timeout: Duration::from_secs(300),
            stream_sweep_interval: Duration::from_secs(60),
            turn_detection: TurnDetectionMode::Server,
            vad_threshold: 0.01,
            vad_window_frames: 10,
            vad_silence_frames: 12,
            reorder_window: 8,
            send_queue_frames: 64,
            default_tenant: "default".to_string(),
            menu_path: None,
            free_text_cap: 200,
        }
    }
}

impl ServerConfig {
    /// Get the full server address as host:port
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_instructions() -> String {
    "You are a friendly voice ordering assistant for a restaurant. Take the \
     customer's order item by item, confirm quantities and modifiers, and use \
     the provided tools to record the order. Keep replies short and spoken."
        .to_string()
}
