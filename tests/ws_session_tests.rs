//! End-to-end tests for the client voice WebSocket against a fake upstream
//! speech API.

mod common;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::protocol::Message;

use common::*;
use ordervox::core::audio;

async fn send_event(ws: &mut ServerSocket, value: Value) {
    let _ = ws.send(Message::Text(value.to_string().into())).await;
}

/// Counts audio appends; after the third, emits a final transcript and an
/// audio delta. Acknowledges tool outputs with a transcript.
async fn transcribing_upstream(mut ws: ServerSocket) {
    let mut appends = 0u32;
    while let Some(Ok(frame)) = ws.next().await {
        let Message::Text(text) = frame else { continue };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if value["type"] == "input_audio_buffer.append" {
            appends += 1;
            if appends == 3 {
                send_event(
                    &mut ws,
                    json!({
                        "type": "response.audio_transcript.done",
                        "transcript": "two soul bowls please",
                    }),
                )
                .await;
                send_event(
                    &mut ws,
                    json!({
                        "type": "response.audio.delta",
                        "delta": audio::pcm16_to_wire(&[500i16; 480]),
                    }),
                )
                .await;
            }
        }
    }
}

/// Issues an add_items function call as soon as the session is configured,
/// then confirms once the tool output comes back.
async fn ordering_upstream(mut ws: ServerSocket) {
    let mut sent_call = false;
    while let Some(Ok(frame)) = ws.next().await {
        let Message::Text(text) = frame else { continue };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        match value["type"].as_str().unwrap_or("") {
            "session.update" if !sent_call => {
                sent_call = true;
                send_event(
                    &mut ws,
                    json!({
                        "type": "response.function_call_arguments.done",
                        "name": "add_items",
                        "call_id": "call_1",
                        "arguments": r#"{"items":[{"name":"Soul Bowl","quantity":2}]}"#,
                    }),
                )
                .await;
            }
            "conversation.item.create" => {
                send_event(
                    &mut ws,
                    json!({
                        "type": "response.audio_transcript.done",
                        "transcript": "added two soul bowls",
                    }),
                )
                .await;
            }
            _ => {}
        }
    }
}

/// Claims a response is in flight as soon as the session is configured, then
/// reports the caller speaking over it; acknowledges only after seeing the
/// cancel-and-clear pair come back.
async fn interrupting_upstream(mut ws: ServerSocket) {
    let mut cancelled = false;
    let mut cleared = false;
    while let Some(Ok(frame)) = ws.next().await {
        let Message::Text(text) = frame else { continue };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        match value["type"].as_str().unwrap_or("") {
            "session.update" => {
                send_event(&mut ws, json!({"type": "response.created"})).await;
                send_event(
                    &mut ws,
                    json!({"type": "input_audio_buffer.speech_started"}),
                )
                .await;
            }
            "response.cancel" => cancelled = true,
            "input_audio_buffer.clear" => cleared = true,
            _ => {}
        }
        if cancelled && cleared {
            cancelled = false;
            cleared = false;
            send_event(
                &mut ws,
                json!({
                    "type": "response.audio_transcript.done",
                    "transcript": "response interrupted",
                }),
            )
            .await;
        }
    }
}

/// Accepts one WebSocket handshake and drops it, then refuses every further
/// TCP connection so the reconnect budget actually runs out.
async fn spawn_slamming_upstream() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut first = true;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            if first {
                first = false;
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    drop(ws);
                }
            } else {
                drop(stream);
            }
        }
    });
    format!("ws://{addr}")
}

async fn start_session(client: &mut ClientSocket, config: Value) -> Value {
    send_json(
        client,
        json!({"type": "session.start", "session_config": config}),
    )
    .await;
    recv_json(client).await
}

#[tokio::test]
async fn test_session_start_audio_and_transcript_roundtrip() {
    let upstream = spawn_mock_upstream(transcribing_upstream).await;
    let (base, state) = spawn_app(test_config(&upstream)).await;
    let mut client = connect(&format!("{base}/ws")).await;

    let started = start_session(&mut client, json!({"tenant_id": "default"})).await;
    assert_eq!(started["type"], "session.started");
    assert!(started["session_id"].is_string());
    assert!(started["event_id"].is_string());
    assert_eq!(state.sessions.session_count(), 1);

    let frame = audio::pcm16_to_wire(&[1000i16; 480]);
    for _ in 0..3 {
        send_json(&mut client, json!({"type": "audio", "audio": frame})).await;
    }

    let transcript = recv_json(&mut client).await;
    assert_eq!(transcript["type"], "transcript");
    assert_eq!(transcript["transcript"], "two soul bowls please");
    assert_eq!(transcript["is_final"], true);

    let downstream = recv_json(&mut client).await;
    assert_eq!(downstream["type"], "audio");
    let pcm = audio::wire_to_pcm16(downstream["audio"].as_str().unwrap()).unwrap();
    assert_eq!(pcm, vec![500i16; 480]);
}

#[tokio::test]
async fn test_function_call_updates_order_and_replies_upstream() {
    let upstream = spawn_mock_upstream(ordering_upstream).await;
    let (base, _state) = spawn_app(test_config(&upstream)).await;
    let mut client = connect(&format!("{base}/ws")).await;

    let started = start_session(&mut client, json!({})).await;
    assert_eq!(started["type"], "session.started");

    let detected = recv_json(&mut client).await;
    assert_eq!(detected["type"], "order.detected");
    assert_eq!(detected["order"]["status"], "collecting");
    assert_eq!(detected["order"]["items"][0]["name"], "Soul Bowl");
    assert_eq!(detected["order"]["items"][0]["quantity"], 2);

    // The tool output round-tripped: upstream acknowledged it
    let transcript = recv_json(&mut client).await;
    assert_eq!(transcript["type"], "transcript");
    assert_eq!(transcript["transcript"], "added two soul bowls");
}

#[tokio::test]
async fn test_loopback_session_echoes_audio_without_upstream() {
    // Nothing listens on the upstream port; loopback must not care
    let (base, state) = spawn_app(test_config("ws://127.0.0.1:9")).await;
    let mut client = connect(&format!("{base}/ws")).await;

    let started = start_session(&mut client, json!({"loopback": true})).await;
    assert_eq!(started["type"], "session.started");

    let frame = audio::pcm16_to_wire(&[42i16; 480]);
    send_json(&mut client, json!({"type": "audio", "audio": frame})).await;

    let echoed = recv_json(&mut client).await;
    assert_eq!(echoed["type"], "audio");
    assert_eq!(echoed["audio"], frame);
    assert_eq!(state.sessions.session_count(), 1);
}

#[tokio::test]
async fn test_failed_session_start_reports_error_and_registers_nothing() {
    let (base, state) = spawn_app(test_config("ws://127.0.0.1:9")).await;
    let mut client = connect(&format!("{base}/ws")).await;

    let reply = start_session(&mut client, json!({})).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"]["code"], "session_start_error");
    assert_eq!(state.sessions.session_count(), 0);

    // The connection survives and can still heartbeat
    send_json(&mut client, json!({"type": "heartbeat"})).await;
    let pong = recv_json(&mut client).await;
    assert_eq!(pong["type"], "heartbeat");
}

#[tokio::test]
async fn test_reconnect_exhaustion_sends_exactly_one_error_frame() {
    let upstream = spawn_slamming_upstream().await;
    let (base, state) = spawn_app(test_config(&upstream)).await;
    let mut client = connect(&format!("{base}/ws")).await;

    let started = start_session(&mut client, json!({})).await;
    assert_eq!(started["type"], "session.started");

    // The upstream drops every socket; after the bounded reconnect budget the
    // client sees one terminal error and the socket closes
    let frames = drain_until_close(&mut client).await;
    let errors: Vec<&Value> = frames.iter().filter(|f| f["type"] == "error").collect();
    assert_eq!(errors.len(), 1, "frames: {frames:?}");
    assert_eq!(errors[0]["error"]["code"], "connection_error");

    assert!(wait_for(|| state.sessions.session_count() == 0, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_malformed_audio_is_dropped_without_closing_the_stream() {
    let (base, _state) = spawn_app(test_config("ws://127.0.0.1:9")).await;
    let mut client = connect(&format!("{base}/ws")).await;

    start_session(&mut client, json!({"loopback": true})).await;

    // Invalid base64, then odd-length payload: both dropped silently
    send_json(&mut client, json!({"type": "audio", "audio": "@@@not-base64@@@"})).await;
    send_json(&mut client, json!({"type": "audio", "audio": "AAAA"})).await;

    // A valid frame still round-trips afterwards
    let frame = audio::pcm16_to_wire(&[7i16; 480]);
    send_json(&mut client, json!({"type": "audio", "audio": frame})).await;
    let echoed = recv_json(&mut client).await;
    assert_eq!(echoed["audio"], frame);
}

#[tokio::test]
async fn test_barge_in_cancels_inflight_response() {
    let upstream = spawn_mock_upstream(interrupting_upstream).await;
    let (base, _state) = spawn_app(test_config(&upstream)).await;
    let mut client = connect(&format!("{base}/ws")).await;

    let started = start_session(&mut client, json!({})).await;
    assert_eq!(started["type"], "session.started");

    // The upstream acknowledges only after the bridge cancels the response
    // and clears the input buffer
    let transcript = recv_json(&mut client).await;
    assert_eq!(transcript["type"], "transcript");
    assert_eq!(transcript["transcript"], "response interrupted");
}

#[tokio::test]
async fn test_reaped_loopback_session_stops_echoing_and_closes() {
    let mut config = test_config("ws://127.0.0.1:9");
    config.session_idle_timeout = Duration::from_millis(50);
    config.session_reaper_interval = Duration::from_millis(25);
    let (base, state) = spawn_app(config).await;
    let mut client = connect(&format!("{base}/ws")).await;

    start_session(&mut client, json!({"loopback": true})).await;
    assert!(wait_for(|| state.sessions.session_count() == 0, Duration::from_secs(2)).await);

    // Audio after the reaper reclaimed the session must close the socket
    // instead of echoing
    let frame = audio::pcm16_to_wire(&[9i16; 480]);
    send_json(&mut client, json!({"type": "audio", "audio": frame})).await;
    let frames = drain_until_close(&mut client).await;
    assert!(
        frames.iter().all(|f| f["type"] != "audio"),
        "frames: {frames:?}"
    );
}

#[tokio::test]
async fn test_session_stop_closes_socket_and_clears_table() {
    let (base, state) = spawn_app(test_config("ws://127.0.0.1:9")).await;
    let mut client = connect(&format!("{base}/ws")).await;

    start_session(&mut client, json!({"loopback": true})).await;
    assert_eq!(state.sessions.session_count(), 1);

    send_json(&mut client, json!({"type": "session.stop"})).await;
    drain_until_close(&mut client).await;
    assert!(wait_for(|| state.sessions.session_count() == 0, Duration::from_secs(2)).await);
}
