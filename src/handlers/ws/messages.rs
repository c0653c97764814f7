//! Client wire protocol: JSON frames over the voice WebSocket.
//!
//! Every server frame carries `type`, `event_id`, and `timestamp`; the
//! envelope fields are injected at send time so message construction stays
//! pure and testable.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::core::order::OrderDraft;

/// Frames the client sends to the bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum IncomingMessage {
    #[serde(rename = "session.start")]
    SessionStart { session_config: SessionConfig },
    #[serde(rename = "session.stop")]
    SessionStop,
    #[serde(rename = "audio")]
    Audio { audio: String },
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// `kiosk` (default) or `staff`
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub audio_format: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    /// Echo audio straight back without an upstream connection; used for
    /// client-side pipeline testing.
    #[serde(default)]
    pub loopback: bool,
}

/// Frames the bridge sends to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum OutgoingMessage {
    #[serde(rename = "session.started")]
    SessionStarted { session_id: String },
    #[serde(rename = "transcript")]
    Transcript {
        transcript: String,
        is_final: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },
    #[serde(rename = "audio")]
    Audio { audio: String },
    #[serde(rename = "order.detected")]
    OrderDetected { order: OrderDraft },
    #[serde(rename = "heartbeat")]
    Heartbeat { session_id: String },
    #[serde(rename = "error")]
    Error { error: ErrorBody },
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl OutgoingMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        OutgoingMessage::Error {
            error: ErrorBody {
                code: code.to_string(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Serialize with the `event_id`/`timestamp` envelope applied.
    pub fn to_wire(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if let Some(map) = value.as_object_mut() {
            map.insert("event_id".to_string(), json!(Uuid::new_v4().to_string()));
            map.insert("timestamp".to_string(), json!(now_ms()));
        }
        value.to_string()
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
