//! Carrier media-stream events (vendor convention: camelCase fields, frames
//! discriminated by `event`).

use serde::Deserialize;
use serde_json::json;

/// Inbound control/media events from the carrier gateway.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
pub enum TelephonyEvent {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "start")]
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        #[serde(rename = "callSid", default)]
        call_sid: Option<String>,
        #[serde(rename = "mediaFormat", default)]
        media_format: Option<MediaFormat>,
    },
    #[serde(rename = "media")]
    Media { media: MediaPayload },
    /// Playback-confirmation echo; informational only.
    #[serde(rename = "mark")]
    Mark,
    #[serde(rename = "stop")]
    Stop,
}

#[derive(Debug, Deserialize)]
pub struct MediaFormat {
    pub encoding: String,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    pub channels: u32,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    #[serde(default)]
    pub track: Option<String>,
    /// Monotonic chunk counter, sent as a decimal string.
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Base64 narrowband audio.
    pub payload: String,
}

/// Outbound media frame carrying base64 narrowband audio back to the caller.
pub fn media_frame(stream_sid: &str, payload_b64: &str) -> String {
    json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": { "payload": payload_b64 },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_event_parses() {
        let frame = r#"{"event":"start","streamSid":"MZ123","callSid":"CA456","mediaFormat":{"encoding":"audio/x-mulaw","sampleRate":8000,"channels":1}}"#;
        match serde_json::from_str::<TelephonyEvent>(frame) {
            Ok(TelephonyEvent::Start {
                stream_sid,
                call_sid,
                media_format,
            }) => {
                assert_eq!(stream_sid, "MZ123");
                assert_eq!(call_sid.as_deref(), Some("CA456"));
                assert_eq!(media_format.unwrap().sample_rate, 8000);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_media_event_parses() {
        let frame = r#"{"event":"media","media":{"track":"inbound","chunk":"3","timestamp":"120","payload":"//8A"}}"#;
        match serde_json::from_str::<TelephonyEvent>(frame) {
            Ok(TelephonyEvent::Media { media }) => {
                assert_eq!(media.chunk.as_deref(), Some("3"));
                assert_eq!(media.payload, "//8A");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_media_frame_shape() {
        let wire = media_frame("MZ123", "AAAA");
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "MZ123");
        assert_eq!(value["media"]["payload"], "AAAA");
    }
}
