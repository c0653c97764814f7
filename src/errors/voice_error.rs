//! Error taxonomy for the voice pipeline.
//!
//! Each class carries its own propagation policy:
//! - `MalformedAudio` is per-frame: drop the frame, bump a counter, keep streaming.
//! - `Connection` triggers the bounded reconnect policy; exhaustion makes it fatal.
//! - `ToolValidation` is relayed back to the model as a correction hint.
//! - `SessionTimeout` is raised only by the idle reaper and always results in a
//!   clean teardown, never a user-facing failure.
//! - `UpstreamProtocol` is classified by code into retryable vs. terminal.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the voice bridge pipeline.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Truncated or invalid audio payload. Per-frame, never fatal.
    #[error("malformed audio: {0}")]
    MalformedAudio(String),

    /// Transport-level failure on the upstream socket.
    #[error("connection error: {0}")]
    Connection(String),

    /// A function call failed local re-validation.
    #[error("tool validation failed: {0}")]
    ToolValidation(String),

    /// Session exceeded the idle timeout and was reclaimed by the reaper.
    #[error("session idle for longer than {0:?}")]
    SessionTimeout(Duration),

    /// The upstream API reported an error event.
    #[error("upstream protocol error ({}): {message}", code.as_deref().unwrap_or("unknown"))]
    UpstreamProtocol {
        code: Option<String>,
        message: String,
    },

    /// Session creation failed before any state was registered.
    #[error("failed to start session: {0}")]
    SessionStart(String),
}

impl VoiceError {
    /// Whether the reconnect policy should retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            VoiceError::Connection(_) => true,
            VoiceError::UpstreamProtocol { code, .. } => is_retryable_code(code.as_deref()),
            _ => false,
        }
    }

    /// Stable machine-readable code used in client-facing `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            VoiceError::MalformedAudio(_) => "malformed_audio",
            VoiceError::Connection(_) => "connection_error",
            VoiceError::ToolValidation(_) => "tool_validation_error",
            VoiceError::SessionTimeout(_) => "session_timeout",
            VoiceError::UpstreamProtocol { .. } => "upstream_error",
            VoiceError::SessionStart(_) => "session_start_error",
        }
    }
}

/// Classify an upstream error code as retryable or terminal.
///
/// Unknown codes are treated as terminal so a misbehaving upstream cannot keep
/// the session in a reconnect loop.
pub fn is_retryable_code(code: Option<&str>) -> bool {
    matches!(
        code,
        Some("server_error") | Some("internal_error") | Some("rate_limit_exceeded")
    )
}

pub type VoiceResult<T> = Result<T, VoiceError>;
