//! Bridge between carrier media-stream WebSockets and voice sessions.
//!
//! Each inbound call socket maps to at most one session, registered here by
//! the carrier-assigned stream identifier. A background sweeper force-closes
//! streams that go quiet; its task handle is stored so shutdown can cancel it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, TurnDetectionMode};
use crate::core::audio::{self, AudioFrame, FrameSource, ReorderBuffer};
use crate::core::session::{SessionContext, SessionState, VoiceSession};
use crate::core::upstream::{AdapterEvent, UpstreamSpeechAdapter};
use crate::core::vad::{EnergyVad, EnergyVadConfig, TurnGate};
use crate::handlers::ws::messages::now_ms;
use crate::state::AppState;

use super::events::{TelephonyEvent, media_frame};

const OUTGOING_CHANNEL_SIZE: usize = 256;
const ADAPTER_CHANNEL_SIZE: usize = 256;

struct StreamEntry {
    session: Arc<VoiceSession>,
    /// Signals the owning socket task to tear the stream down.
    close_tx: mpsc::Sender<()>,
}

/// Registry of live carrier streams, keyed by stream identifier.
pub struct TelephonyBridge {
    config: ServerConfig,
    streams: SyncMutex<HashMap<String, StreamEntry>>,
    sweeper: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TelephonyBridge {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            streams: SyncMutex::new(HashMap::new()),
            sweeper: SyncMutex::new(None),
        }
    }

    fn register(&self, stream_sid: &str, session: Arc<VoiceSession>, close_tx: mpsc::Sender<()>) {
        self.streams.lock().insert(
            stream_sid.to_string(),
            StreamEntry { session, close_tx },
        );
    }

    fn remove(&self, stream_sid: &str) {
        self.streams.lock().remove(stream_sid);
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Start the registry sweeper. Idle streams are asked to close via their
    /// socket task, which runs the full dual-cleanup path.
    pub fn start_sweeper(self: &Arc<Self>) {
        let bridge = self.clone();
        let interval = self.config.stream_sweep_interval;
        let idle_timeout = self.config.stream_idle_timeout;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stale: Vec<(String, mpsc::Sender<()>)> = bridge
                    .streams
                    .lock()
                    .iter()
                    .filter(|(_, e)| e.session.idle_for() > idle_timeout)
                    .map(|(sid, e)| (sid.clone(), e.close_tx.clone()))
                    .collect();
                for (stream_sid, close_tx) in stale {
                    warn!(%stream_sid, "Sweeping idle telephony stream");
                    if close_tx.send(()).await.is_err() {
                        // Socket task already gone; drop the orphan entry
                        bridge.remove(&stream_sid);
                    }
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Cancel the sweeper and ask every live stream to close.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let close_channels: Vec<mpsc::Sender<()>> = self
            .streams
            .lock()
            .values()
            .map(|e| e.close_tx.clone())
            .collect();
        for close_tx in close_channels {
            let _ = close_tx.send(()).await;
        }
    }
}

impl Drop for TelephonyBridge {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

/// Per-call socket state.
struct CallStream {
    stream_sid: Option<String>,
    session: Option<Arc<VoiceSession>>,
    adapter: Option<Arc<UpstreamSpeechAdapter>>,
    reorder: ReorderBuffer,
    /// Fallback sequence counter for media frames without a chunk number.
    synthetic_seq: u64,
    vad: EnergyVad,
    gate: TurnGate,
}

pub async fn telephony_media_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!("Telephony media stream upgrade requested");
    ws.on_upgrade(move |socket| handle_media_socket(socket, state))
}

async fn handle_media_socket(socket: WebSocket, app_state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTGOING_CHANNEL_SIZE);
    let (close_tx, mut close_rx) = mpsc::channel::<()>(1);

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let mut call = CallStream {
        stream_sid: None,
        session: None,
        adapter: None,
        reorder: ReorderBuffer::new(app_state.config.reorder_window),
        synthetic_seq: 0,
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
                    if !handle_carrier_frame(&text, &mut call, &mut events_rx, &close_tx, &app_state).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Carrier closed the media socket");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Media socket error: {e}");
                    break;
                }
            },

            event = next_adapter_event(&mut events_rx) => match event {
                Some(event) => {
                    if !handle_adapter_event(event, &call, &out_tx, &app_state).await {
                        break;
                    }
                }
                None => break,
            },

            _ = close_rx.recv() => {
                info!(stream_sid = call.stream_sid.as_deref().unwrap_or(""), "Stream close requested");
                break;
            }
        }
    }

    // Both cleanup halves must run even if one side already failed: the
    // registry entry goes away and the session is stopped
    drop(out_tx);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), sender_task).await;
    if let Some(stream_sid) = &call.stream_sid {
        app_state.bridge.remove(stream_sid);
    }
    if let Some(session) = &call.session {
        app_state.sessions.stop_session(&session.session_id).await;
    }
    info!("Telephony media stream terminated");
}

async fn next_adapter_event(rx: &mut Option<mpsc::Receiver<AdapterEvent>>) -> Option<AdapterEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_carrier_frame(
    text: &str,
    call: &mut CallStream,
    events_rx: &mut Option<mpsc::Receiver<AdapterEvent>>,
    close_tx: &mpsc::Sender<()>,
    app_state: &Arc<AppState>,
) -> bool {
    let event: TelephonyEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!("Unparseable carrier frame: {e}");
            return true;
        }
    };

    match event {
        TelephonyEvent::Connected => {
            debug!("Carrier handshake received");
            true
        }

        TelephonyEvent::Start {
            stream_sid,
            call_sid,
            media_format,
        } => {
            if call.session.is_some() {
                warn!(stream_sid, "Duplicate start event on media stream");
                return true;
            }
            if let Some(format) = &media_format {
                debug!(
                    encoding = %format.encoding,
                    sample_rate = format.sample_rate,
                    "Carrier media format"
                );
            }

            let (events_tx, rx) = mpsc::channel(ADAPTER_CHANNEL_SIZE);
            match app_state
                .sessions
                .start_session(
                    SessionContext::Kiosk,
                    &app_state.config.default_tenant,
                    false,
                    events_tx,
                )
                .await
            {
                Ok(session) => {
                    info!(
                        %stream_sid,
                        call_sid = call_sid.as_deref().unwrap_or(""),
                        session_id = %session.session_id,
                        "Call stream started"
                    );
                    call.adapter = app_state.sessions.adapter_for(&session.session_id);
                    *events_rx = Some(rx);
                    app_state
                        .bridge
                        .register(&stream_sid, session.clone(), close_tx.clone());
                    call.stream_sid = Some(stream_sid);
                    call.session = Some(session);
                    true
                }
                Err(e) => {
                    warn!(stream_sid, "Failed to start call session: {e}");
                    false
                }
            }
        }

        TelephonyEvent::Media { media } => {
            let Some(session) = &call.session else {
                debug!("Media before start; dropping frame");
                return true;
            };
            session.touch();

            let payload = match BASE64.decode(media.payload.as_bytes()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    session.metrics.error_count.fetch_add(1, Ordering::Relaxed);
                    debug!("Dropping malformed media payload: {e}");
                    return true;
                }
            };

            // Carrier chunk numbers are 1-based; the reorder cursor is 0-based
            let sequence_number = media
                .chunk
                .as_deref()
                .and_then(|c| c.parse::<u64>().ok())
                .map(|c| c.saturating_sub(1))
                .unwrap_or_else(|| {
                    let seq = call.synthetic_seq;
                    call.synthetic_seq += 1;
                    seq
                });

            let released = call.reorder.push(AudioFrame {
                sequence_number,
                payload: Bytes::from(payload),
                captured_at_ms: now_ms(),
                source: FrameSource::Client,
            });
            session
                .metrics
                .frames_dropped
                .store(call.reorder.dropped(), Ordering::Relaxed);

            for frame in released {
                match audio::telephony_to_wideband(&frame.payload) {
                    Ok(pcm) => {
                        session.metrics.audio_ms_processed.fetch_add(
                            frame.payload.len() as u64 * 1000 / audio::NARROWBAND_RATE as u64,
                            Ordering::Relaxed,
                        );
                        if let Some(adapter) = &call.adapter {
                            if app_state.config.turn_detection == TurnDetectionMode::Local {
                                let speaking = call.vad.observe(&pcm);
                                if call.gate.observe(speaking) {
                                    debug!("Local VAD committed a call turn");
                                    adapter.commit_turn();
                                }
                            }
                            adapter.send_audio(&pcm);
                        }
                    }
                    Err(e) => {
                        session.metrics.error_count.fetch_add(1, Ordering::Relaxed);
                        debug!("Dropping untranscodable media frame: {e}");
                    }
                }
            }
            true
        }

        TelephonyEvent::Mark => {
            debug!("Playback mark received");
            true
        }

        TelephonyEvent::Stop => {
            info!(
                stream_sid = call.stream_sid.as_deref().unwrap_or(""),
                "Carrier stop event"
            );
            false
        }
    }
}

async fn handle_adapter_event(
    event: AdapterEvent,
    call: &CallStream,
    out_tx: &mpsc::Sender<String>,
    app_state: &Arc<AppState>,
) -> bool {
    let Some(session) = &call.session else {
        return true;
    };

    match event {
        AdapterEvent::Audio(pcm_bytes) => {
            let Some(stream_sid) = &call.stream_sid else {
                return true;
            };
            match audio::pcm16_from_le_bytes(&pcm_bytes)
                .and_then(|pcm| audio::wideband_to_telephony(&pcm))
            {
                Ok(mulaw) => {
                    let _ = out_tx
                        .send(media_frame(stream_sid, &BASE64.encode(&mulaw)))
                        .await;
                }
                Err(e) => {
                    session.metrics.error_count.fetch_add(1, Ordering::Relaxed);
                    debug!("Dropping untranscodable upstream audio: {e}");
                }
            }
            true
        }

        AdapterEvent::Transcript { text, is_final, .. } => {
            if is_final {
                session
                    .metrics
                    .transcript_count
                    .fetch_add(1, Ordering::Relaxed);
                debug!(session_id = %session.session_id, transcript = %text, "Call transcript");
            }
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
            if let Some(adapter) = &call.adapter {
                adapter.send_tool_result(&call_id, &outcome.reply);
            }
            if outcome.draft_changed {
                session.set_state(if outcome.confirmed {
                    SessionState::OrderConfirmed
                } else {
                    SessionState::OrderDrafting
                });
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
            warn!(session_id = %session.session_id, "Fatal upstream error on call: {err}");
            false
        }

        AdapterEvent::Closed => false,
    }
}
