//! Wire message schema for the upstream conversational speech API.
//!
//! Outgoing and incoming frames are closed tagged unions. The upstream
//! contract is additive: unknown fields inside known events are ignored by
//! serde, and whole event types we do not model are skipped with a debug log
//! rather than failing the stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Events this bridge sends to the upstream API.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum UpstreamRequest {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionParams },
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    AudioCommit,
    #[serde(rename = "input_audio_buffer.clear")]
    AudioClear,
    #[serde(rename = "conversation.item.create")]
    ItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseParams>,
    },
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl UpstreamRequest {
    pub fn to_wire(&self) -> String {
        // Serialization of these closed variants cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
pub struct SessionParams {
    pub model: String,
    pub instructions: String,
    pub voice: String,
    pub modalities: Vec<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    /// None disables server-side turn detection (local VAD mode)
    pub turn_detection: Option<TurnDetectionParams>,
    pub tools: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct TurnDetectionParams {
    #[serde(rename = "type")]
    pub kind: String,
}

impl TurnDetectionParams {
    pub fn server_vad() -> Self {
        Self {
            kind: "server_vad".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ConversationItem {
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: String, output: String },
}

#[derive(Debug, Serialize)]
pub struct ResponseParams {
    pub modalities: Vec<String>,
}

/// Events the upstream API sends to this bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum UpstreamEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "response.created")]
    ResponseCreated,
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone { transcript: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptDone { transcript: String },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallDone {
        name: String,
        call_id: String,
        arguments: String,
    },
    #[serde(rename = "error")]
    Error { error: UpstreamErrorBody },
}

#[derive(Debug, Deserialize)]
pub struct UpstreamErrorBody {
    pub code: Option<String>,
    pub message: String,
}

/// Parse one inbound text frame.
///
/// Returns `None` for event types outside the modeled set (tolerated as
/// additive contract changes) and for frames that are not JSON objects at all
/// (logged at warn, then skipped).
pub fn parse_event(text: &str) -> Option<UpstreamEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("Discarding non-JSON upstream frame: {e}");
            return None;
        }
    };

    let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");
    match serde_json::from_value::<UpstreamEvent>(value.clone()) {
        Ok(event) => Some(event),
        Err(e) => {
            if event_type.is_empty() {
                warn!("Upstream frame missing 'type': {e}");
            } else {
                debug!("Ignoring unmodeled upstream event '{event_type}'");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_append_wire_shape() {
        let wire = UpstreamRequest::AudioAppend {
            audio: "AAAA".to_string(),
        }
        .to_wire();
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["type"], "input_audio_buffer.append");
        assert_eq!(value["audio"], "AAAA");
    }

    #[test]
    fn test_session_update_omits_turn_detection_when_local() {
        let wire = UpstreamRequest::SessionUpdate {
            session: SessionParams {
                model: "gpt-realtime".to_string(),
                instructions: "take orders".to_string(),
                voice: "alloy".to_string(),
                modalities: vec!["audio".to_string(), "text".to_string()],
                input_audio_format: "pcm16".to_string(),
                output_audio_format: "pcm16".to_string(),
                turn_detection: None,
                tools: vec![],
            },
        }
        .to_wire();
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert!(value["session"]["turn_detection"].is_null());
    }

    #[test]
    fn test_parse_known_event() {
        let event = parse_event(r#"{"type":"response.audio.delta","delta":"UU=="}"#);
        assert!(matches!(event, Some(UpstreamEvent::AudioDelta { .. })));
    }

    #[test]
    fn test_parse_tolerates_additive_fields() {
        let event = parse_event(
            r#"{"type":"response.audio_transcript.done","transcript":"hi","event_id":"e1","new_field":{"a":1}}"#,
        );
        match event {
            Some(UpstreamEvent::TranscriptDone { transcript }) => assert_eq!(transcript, "hi"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_skips_unknown_event_type() {
        assert!(parse_event(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).is_none());
    }

    #[test]
    fn test_parse_skips_garbage() {
        assert!(parse_event("not json at all").is_none());
    }

    #[test]
    fn test_parse_error_event() {
        let event = parse_event(
            r#"{"type":"error","error":{"code":"server_error","message":"boom","detail":"x"}}"#,
        );
        match event {
            Some(UpstreamEvent::Error { error }) => {
                assert_eq!(error.code.as_deref(), Some("server_error"));
                assert_eq!(error.message, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
