//! Axum WebSocket handler for browser/kiosk voice clients.
//!
//! One socket drives at most one session. The handler owns the client-side
//! pump: a select loop over inbound client frames and the session's adapter
//! events, with a dedicated sender task for outbound frames.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TurnDetectionMode;
use crate::core::audio::{self, WIDEBAND_RATE};
use crate::core::session::{SessionContext, SessionState, VoiceSession};
use crate::core::upstream::{AdapterEvent, UpstreamSpeechAdapter};
use crate::core::vad::{EnergyVad, EnergyVadConfig, TurnGate};
use crate::state::AppState;

use super::messages::{IncomingMessage, OutgoingMessage};

const OUTGOING_CHANNEL_SIZE: usize = 256;
const ADAPTER_CHANNEL_SIZE: usize = 256;

/// Per-socket connection state.
struct Connection {
    session: Option<Arc<VoiceSession>>,
    adapter: Option<Arc<UpstreamSpeechAdapter>>,
    loopback: bool,
    vad: EnergyVad,
    gate: TurnGate,
}

pub async fn ws_voice_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!("Voice WebSocket upgrade requested");
    ws.on_upgrade(move |socket| handle_voice_socket(socket, state))
}

async fn handle_voice_socket(socket: WebSocket, app_state: Arc<AppState>) {
    info!("Voice WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<OutgoingMessage>(OUTGOING_CHANNEL_SIZE);

    let sender_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sender
                .send(Message::Text(message.to_wire().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let mut conn = Connection {
        session: None,
        adapter: None,
        loopback: false,
        vad: EnergyVad::new(EnergyVadConfig {
            window_frames: app_state.config.vad_window_frames,
            threshold: app_state.config.vad_threshold,
        }),
        gate: TurnGate::new(app_state.config.vad_silence_frames),
    };
    let mut events_rx: Option<mpsc::Receiver<AdapterEvent>> = None;

    loop {
        select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if !handle_client_frame(&text, &mut conn, &mut events_rx, &out_tx, &app_state).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client closed the voice socket");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Voice socket error: {e}");
                    break;
                }
            },

            event = next_adapter_event(&mut events_rx) => match event {
                Some(event) => {
                    if !handle_adapter_event(event, &conn, &out_tx, &app_state).await {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    // Let queued frames (e.g. a terminal error) flush before the socket drops
    drop(out_tx);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), sender_task).await;
    if let Some(session) = &conn.session {
        app_state.sessions.stop_session(&session.session_id).await;
    }
    info!("Voice WebSocket connection terminated");
}

async fn next_adapter_event(rx: &mut Option<mpsc::Receiver<AdapterEvent>>) -> Option<AdapterEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Process one client frame; returns false when the socket should close.
async fn handle_client_frame(
    text: &str,
    conn: &mut Connection,
    events_rx: &mut Option<mpsc::Receiver<AdapterEvent>>,
    out_tx: &mpsc::Sender<OutgoingMessage>,
    app_state: &Arc<AppState>,
) -> bool {
    let incoming: IncomingMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Unparseable client frame: {e}");
            let _ = out_tx
                .send(OutgoingMessage::error(
                    "invalid_message",
                    format!("invalid frame: {e}"),
                ))
                .await;
            return true;
        }
    };

    // A session reclaimed out from under this socket (idle reaper) no longer
    // serves it; close instead of echoing into the void
    if let Some(session) = &conn.session {
        if session.state() == SessionState::Ended {
            debug!("Frame for an ended session; closing the socket");
            return false;
        }
    }

    match incoming {
        IncomingMessage::SessionStart { session_config } => {
            if conn.session.is_some() {
                let _ = out_tx
                    .send(OutgoingMessage::error(
                        "session_start_error",
                        "session already started on this connection",
                    ))
                    .await;
                return true;
            }

            let context = match &session_config.context {
                Some(raw) => match SessionContext::parse(raw) {
                    Some(context) => context,
                    None => {
                        let _ = out_tx
                            .send(OutgoingMessage::error(
                                "session_start_error",
                                format!("unknown context '{raw}'"),
                            ))
                            .await;
                        return true;
                    }
                },
                None => SessionContext::Kiosk,
            };
            let tenant_id = session_config
                .tenant_id
                .clone()
                .unwrap_or_else(|| app_state.config.default_tenant.clone());

            let (events_tx, rx) = mpsc::channel(ADAPTER_CHANNEL_SIZE);
            match app_state
                .sessions
                .start_session(context, &tenant_id, session_config.loopback, events_tx)
                .await
            {
                Ok(session) => {
                    conn.adapter = app_state.sessions.adapter_for(&session.session_id);
                    conn.loopback = session_config.loopback;
                    if conn.adapter.is_some() {
                        *events_rx = Some(rx);
                    }
                    let _ = out_tx
                        .send(OutgoingMessage::SessionStarted {
                            session_id: session.session_id.clone(),
                        })
                        .await;
                    conn.session = Some(session);
                }
                Err(e) => {
                    warn!("Session start failed: {e}");
                    let _ = out_tx
                        .send(OutgoingMessage::error(e.code(), e.to_string()))
                        .await;
                }
            }
            true
        }

        IncomingMessage::Audio { audio } => {
            let Some(session) = &conn.session else {
                let _ = out_tx
                    .send(OutgoingMessage::error(
                        "invalid_message",
                        "audio before session.start",
                    ))
                    .await;
                return true;
            };
            session.touch();

            let pcm = match audio::wire_to_pcm16(&audio) {
                Ok(pcm) => pcm,
                Err(e) => {
                    // Per-frame loss: count it, keep streaming
                    session.metrics.error_count.fetch_add(1, Ordering::Relaxed);
                    debug!("Dropping malformed client audio frame: {e}");
                    return true;
                }
            };
            session.metrics.audio_ms_processed.fetch_add(
                pcm.len() as u64 * 1000 / WIDEBAND_RATE as u64,
                Ordering::Relaxed,
            );

            if conn.loopback {
                let _ = out_tx.send(OutgoingMessage::Audio { audio }).await;
                return true;
            }

            if let Some(adapter) = &conn.adapter {
                if app_state.config.turn_detection == TurnDetectionMode::Local {
                    let speaking = conn.vad.observe(&pcm);
                    if conn.gate.observe(speaking) {
                        debug!("Local VAD committed a turn");
                        adapter.commit_turn();
                    }
                }
                adapter.send_audio(&pcm);
            }
            true
        }

        IncomingMessage::Heartbeat => {
            let session_id = match &conn.session {
                Some(session) => {
                    session.touch();
                    session.session_id.clone()
                }
                None => String::new(),
            };
            let _ = out_tx.send(OutgoingMessage::Heartbeat { session_id }).await;
            true
        }

        IncomingMessage::SessionStop => {
            if let Some(session) = &conn.session {
                app_state.sessions.stop_session(&session.session_id).await;
            }
            false
        }
    }
}

/// Relay one adapter event to the client; returns false on terminal events.
async fn handle_adapter_event(
    event: AdapterEvent,
    conn: &Connection,
    out_tx: &mpsc::Sender<OutgoingMessage>,
    app_state: &Arc<AppState>,
) -> bool {
    let Some(session) = &conn.session else {
        return true;
    };

    match event {
        AdapterEvent::Transcript {
            text,
            is_final,
            confidence,
        } => {
            if is_final {
                session
                    .metrics
                    .transcript_count
                    .fetch_add(1, Ordering::Relaxed);
            }
            session.touch();
            let _ = out_tx
                .send(OutgoingMessage::Transcript {
                    transcript: text,
                    is_final,
                    confidence,
                })
                .await;
            true
        }

        AdapterEvent::Audio(pcm_bytes) => {
            let _ = out_tx
                .send(OutgoingMessage::Audio {
                    audio: BASE64.encode(&pcm_bytes),
                })
                .await;
            true
        }

        AdapterEvent::FunctionCall {
            name,
            call_id,
            arguments,
        } => {
            session.touch();
            let outcome = session.with_draft(|draft| {
                app_state.order_router.handle(
                    &session.session_id,
                    &session.tenant_id,
                    draft,
                    &name,
                    &arguments,
                )
            });
            if let Some(adapter) = &conn.adapter {
                adapter.send_tool_result(&call_id, &outcome.reply);
            }
            if outcome.draft_changed {
                session.set_state(if outcome.confirmed {
                    SessionState::OrderConfirmed
                } else {
                    SessionState::OrderDrafting
                });
                let _ = out_tx
                    .send(OutgoingMessage::OrderDetected {
                        order: session.draft_snapshot(),
                    })
                    .await;
            }
            true
        }

        AdapterEvent::TurnStarted | AdapterEvent::TurnEnded => true,

        AdapterEvent::Reconnecting { attempt } => {
            session
                .metrics
                .reconnect_count
                .fetch_add(1, Ordering::Relaxed);
            info!(
                session_id = %session.session_id,
                attempt, "Upstream reconnecting"
            );
            true
        }

        AdapterEvent::Fatal(err) => {
            session.metrics.error_count.fetch_add(1, Ordering::Relaxed);
            let _ = out_tx
                .send(OutgoingMessage::error(err.code(), err.to_string()))
                .await;
            app_state.sessions.stop_session(&session.session_id).await;
            false
        }

        AdapterEvent::Closed => {
            app_state.sessions.stop_session(&session.session_id).await;
            false
        }
    }
}
