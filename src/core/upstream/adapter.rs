//! WebSocket adapter for the upstream conversational speech API.
//!
//! One adapter owns one outbound connection per active session. The connection
//! lives inside a single spawned task driving a select loop over the socket,
//! a bounded outgoing queue, a heartbeat tick, and a shutdown channel; there
//! are no registered listeners to detach — teardown is the loop exiting.
//!
//! Reconnects are bounded and each attempt constructs a fresh socket; the old
//! one is never reused or raced against the new one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{MissedTickBehavior, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ServerConfig;
use crate::core::audio;
use crate::errors::{VoiceError, VoiceResult};

use super::backoff::ReconnectPolicy;
use super::messages::{
    ConversationItem, ResponseParams, SessionParams, TurnDetectionParams, UpstreamEvent,
    UpstreamRequest, parse_event,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Adapter connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Idle,
    Connecting,
    Connected,
    Streaming,
    Responding,
    Reconnecting,
    Closing,
    Closed,
}

/// Events the adapter delivers to its owning session.
#[derive(Debug)]
pub enum AdapterEvent {
    Transcript {
        text: String,
        is_final: bool,
        confidence: Option<f32>,
    },
    /// Decoded PCM16 little-endian bytes from an upstream audio delta.
    Audio(Vec<u8>),
    FunctionCall {
        name: String,
        call_id: String,
        arguments: String,
    },
    TurnStarted,
    TurnEnded,
    Reconnecting {
        attempt: u32,
    },
    /// Unrecoverable failure; the session must tear down.
    Fatal(VoiceError),
    Closed,
}

/// Configuration for one upstream connection.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub instructions: String,
    pub voice: String,
    /// true: the upstream runs server-side turn detection; false: local VAD
    pub server_turn_detection: bool,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub send_queue_frames: usize,
    pub tools: Vec<Value>,
}

impl UpstreamConfig {
    pub fn from_server(config: &ServerConfig, tools: Vec<Value>) -> Self {
        Self {
            url: config.upstream_url.clone(),
            api_key: config.upstream_api_key.clone(),
            model: config.upstream_model.clone(),
            instructions: config.upstream_instructions.clone(),
            voice: config.upstream_voice.clone(),
            server_turn_detection: matches!(
                config.turn_detection,
                crate::config::TurnDetectionMode::Server
            ),
            connect_timeout: config.connect_timeout,
            heartbeat_interval: config.heartbeat_interval,
            reconnect: ReconnectPolicy {
                max_attempts: config.reconnect_max_attempts,
                base_delay: config.reconnect_base_delay,
                max_delay: config.reconnect_max_delay,
            },
            send_queue_frames: config.send_queue_frames,
            tools,
        }
    }
}

/// Per-adapter counters, readable by the owning session for metrics.
#[derive(Debug, Default)]
pub struct AdapterMetrics {
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub decode_errors: AtomicU64,
    pub reconnects: AtomicU64,
}

/// Why one connection's pump loop ended.
enum PumpExit {
    Shutdown,
    NormalClose,
    Abnormal(String),
    Terminal(VoiceError),
}

pub struct UpstreamSpeechAdapter {
    config: UpstreamConfig,
    state: Arc<SyncRwLock<AdapterState>>,
    outgoing_tx: SyncMutex<Option<mpsc::Sender<String>>>,
    shutdown_tx: SyncMutex<Option<broadcast::Sender<()>>>,
    io_task: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
    events_tx: mpsc::Sender<AdapterEvent>,
    torn_down: AtomicBool,
    metrics: Arc<AdapterMetrics>,
}

impl UpstreamSpeechAdapter {
    pub fn new(config: UpstreamConfig, events_tx: mpsc::Sender<AdapterEvent>) -> Self {
        Self {
            config,
            state: Arc::new(SyncRwLock::new(AdapterState::Idle)),
            outgoing_tx: SyncMutex::new(None),
            shutdown_tx: SyncMutex::new(None),
            io_task: SyncMutex::new(None),
            events_tx,
            torn_down: AtomicBool::new(false),
            metrics: Arc::new(AdapterMetrics::default()),
        }
    }

    pub fn state(&self) -> AdapterState {
        *self.state.read()
    }

    pub fn metrics(&self) -> &AdapterMetrics {
        &self.metrics
    }

    /// Open the upstream connection and start the pump task.
    ///
    /// Fails without registering anything if the initial connect does not
    /// complete within the configured timeout, so a failed session start
    /// leaves no partial state behind.
    pub async fn connect(&self) -> VoiceResult<()> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(VoiceError::Connection("adapter already torn down".into()));
        }

        *self.state.write() = AdapterState::Connecting;
        let socket = connect_once(&self.config).await.inspect_err(|e| {
            *self.state.write() = AdapterState::Closed;
            error!("Upstream connect failed: {e}");
        })?;
        info!("Connected to upstream speech API");

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<String>(self.config.send_queue_frames);
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        *self.outgoing_tx.lock() = Some(outgoing_tx);
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        *self.state.write() = AdapterState::Connected;

        let task = tokio::spawn(run_connection(
            self.config.clone(),
            self.state.clone(),
            self.metrics.clone(),
            self.events_tx.clone(),
            outgoing_rx,
            shutdown_rx,
            socket,
        ));
        *self.io_task.lock() = Some(task);

        Ok(())
    }

    /// Queue one wideband PCM frame for upstream delivery.
    ///
    /// Valid while connected or reconnecting; past the queue bound the frame
    /// is dropped with a warning rather than surfacing an error into the
    /// audio pump.
    pub fn send_audio(&self, pcm: &[i16]) {
        match self.state() {
            AdapterState::Connected
            | AdapterState::Streaming
            | AdapterState::Responding
            | AdapterState::Reconnecting => {}
            other => {
                debug!("Dropping audio frame in adapter state {other:?}");
                return;
            }
        }

        let request = UpstreamRequest::AudioAppend {
            audio: audio::pcm16_to_wire(pcm),
        };
        if self.enqueue(request) {
            self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
            let mut state = self.state.write();
            if *state == AdapterState::Connected {
                *state = AdapterState::Streaming;
            }
        } else {
            self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Signal end-of-utterance. Only used under local turn detection.
    pub fn commit_turn(&self) {
        self.enqueue(UpstreamRequest::AudioCommit);
        self.enqueue(UpstreamRequest::ResponseCreate {
            response: Some(ResponseParams {
                modalities: vec!["audio".to_string(), "text".to_string()],
            }),
        });
    }

    /// Relay a function-call result (or correction hint) back to the model.
    pub fn send_tool_result(&self, call_id: &str, output: &Value) {
        self.enqueue(UpstreamRequest::ItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: call_id.to_string(),
                output: output.to_string(),
            },
        });
        self.enqueue(UpstreamRequest::ResponseCreate {
            response: Some(ResponseParams {
                modalities: vec!["audio".to_string(), "text".to_string()],
            }),
        });
    }

    fn enqueue(&self, request: UpstreamRequest) -> bool {
        let guard = self.outgoing_tx.lock();
        let Some(tx) = guard.as_ref() else {
            debug!("Upstream send before connect; frame dropped");
            return false;
        };
        match tx.try_send(request.to_wire()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Upstream send queue full; dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Upstream connection task gone; frame dropped");
                false
            }
        }
    }

    /// Tear the connection down exactly once.
    ///
    /// Order matters and is part of the contract: the shutdown signal stops
    /// the heartbeat tick and exits the pump loop (nothing left listening),
    /// the loop sends a normal close frame, and only after the task has been
    /// awaited is the handle considered torn down.
    pub async fn disconnect(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        *self.state.write() = AdapterState::Closing;

        let shutdown_tx = self.shutdown_tx.lock().take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }

        let task = self.io_task.lock().take();
        if let Some(task) = task {
            if timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Upstream connection task did not exit within 5s");
            }
        }

        *self.outgoing_tx.lock() = None;
        *self.state.write() = AdapterState::Closed;
        info!("Upstream adapter torn down");
    }
}

impl Drop for UpstreamSpeechAdapter {
    fn drop(&mut self) {
        // Last-resort signal if the owner never called disconnect
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

/// Open one fresh socket, guarded by the connect timeout.
async fn connect_once(config: &UpstreamConfig) -> VoiceResult<WsStream> {
    let mut url = Url::parse(&config.url)
        .map_err(|e| VoiceError::Connection(format!("invalid upstream URL: {e}")))?;
    url.query_pairs_mut().append_pair("model", &config.model);

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| VoiceError::Connection(format!("invalid upstream request: {e}")))?;
    if let Some(key) = &config.api_key {
        let value = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|e| VoiceError::Connection(format!("invalid API key header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let connected = timeout(config.connect_timeout, connect_async(request))
        .await
        .map_err(|_| {
            VoiceError::Connection(format!(
                "upstream connect timed out after {:?}",
                config.connect_timeout
            ))
        })?;
    let (socket, _response) =
        connected.map_err(|e| VoiceError::Connection(format!("upstream connect failed: {e}")))?;
    Ok(socket)
}

fn session_update(config: &UpstreamConfig) -> String {
    UpstreamRequest::SessionUpdate {
        session: SessionParams {
            model: config.model.clone(),
            instructions: config.instructions.clone(),
            voice: config.voice.clone(),
            modalities: vec!["audio".to_string(), "text".to_string()],
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            turn_detection: config
                .server_turn_detection
                .then(TurnDetectionParams::server_vad),
            tools: config.tools.clone(),
        },
    }
    .to_wire()
}

/// Connection task: pump the current socket until it ends, then apply the
/// bounded reconnect policy. Runs until shutdown, normal close, terminal
/// error, or reconnect exhaustion.
async fn run_connection(
    config: UpstreamConfig,
    state: Arc<SyncRwLock<AdapterState>>,
    metrics: Arc<AdapterMetrics>,
    events_tx: mpsc::Sender<AdapterEvent>,
    mut outgoing_rx: mpsc::Receiver<String>,
    mut shutdown_rx: broadcast::Receiver<()>,
    first_socket: WsStream,
) {
    let mut socket = Some(first_socket);

    'conn: while let Some(ws) = socket.take() {
        let exit = pump(
            ws,
            &config,
            &state,
            &metrics,
            &events_tx,
            &mut outgoing_rx,
            &mut shutdown_rx,
        )
        .await;

        match exit {
            PumpExit::Shutdown => break 'conn,
            PumpExit::NormalClose => {
                info!("Upstream closed the connection normally");
                break 'conn;
            }
            PumpExit::Terminal(err) => {
                error!("Terminal upstream error: {err}");
                let _ = events_tx.send(AdapterEvent::Fatal(err)).await;
                break 'conn;
            }
            PumpExit::Abnormal(reason) => {
                warn!("Upstream connection lost: {reason}");
                *state.write() = AdapterState::Reconnecting;

                let mut attempt = 1u32;
                loop {
                    let Some(delay) = config.reconnect.delay_for(attempt) else {
                        let _ = events_tx
                            .send(AdapterEvent::Fatal(VoiceError::Connection(format!(
                                "reconnect attempts exhausted: {reason}"
                            ))))
                            .await;
                        break 'conn;
                    };
                    let _ = events_tx.send(AdapterEvent::Reconnecting { attempt }).await;
                    metrics.reconnects.fetch_add(1, Ordering::Relaxed);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.recv() => break 'conn,
                    }

                    // Fresh socket per attempt; the failed one is already gone
                    match connect_once(&config).await {
                        Ok(new_socket) => {
                            info!("Upstream reconnected on attempt {attempt}");
                            *state.write() = AdapterState::Connected;
                            socket = Some(new_socket);
                            continue 'conn;
                        }
                        Err(e) => {
                            warn!("Reconnect attempt {attempt} failed: {e}");
                            attempt += 1;
                        }
                    }
                }
            }
        }
    }

    *state.write() = AdapterState::Closed;
    let _ = events_tx.send(AdapterEvent::Closed).await;
    debug!("Upstream connection task finished");
}

async fn pump(
    ws: WsStream,
    config: &UpstreamConfig,
    state: &Arc<SyncRwLock<AdapterState>>,
    metrics: &Arc<AdapterMetrics>,
    events_tx: &mpsc::Sender<AdapterEvent>,
    outgoing_rx: &mut mpsc::Receiver<String>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> PumpExit {
    let (mut sink, mut stream) = ws.split();

    // (Re)announce the session configuration on every fresh socket
    if sink
        .send(Message::Text(session_update(config).into()))
        .await
        .is_err()
    {
        return PumpExit::Abnormal("failed to send session configuration".to_string());
    }

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                *state.write() = AdapterState::Closing;
                let _ = sink.send(Message::Close(None)).await;
                return PumpExit::Shutdown;
            }

            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return PumpExit::Abnormal("heartbeat send failed".to_string());
                }
            }

            Some(text) = outgoing_rx.recv() => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return PumpExit::Abnormal("outbound send failed".to_string());
                }
            }

            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Some(exit) = handle_text(&text, state, metrics, events_tx, &mut sink).await {
                        return exit;
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Binary(data))) => {
                    debug!("Ignoring unexpected {}-byte binary upstream frame", data.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    let normal = frame
                        .as_ref()
                        .map(|f| f.code == CloseCode::Normal)
                        .unwrap_or(false);
                    return if normal {
                        PumpExit::NormalClose
                    } else {
                        PumpExit::Abnormal(format!("upstream closed abnormally: {frame:?}"))
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return PumpExit::Abnormal(format!("socket error: {e}")),
                None => return PumpExit::Abnormal("upstream stream ended".to_string()),
            }
        }
    }
}

/// Translate one inbound frame into session events. Returns an exit reason
/// for error events; everything else keeps the pump running.
async fn handle_text(
    text: &str,
    state: &Arc<SyncRwLock<AdapterState>>,
    metrics: &Arc<AdapterMetrics>,
    events_tx: &mpsc::Sender<AdapterEvent>,
    sink: &mut SplitSink<WsStream, Message>,
) -> Option<PumpExit> {
    let event = parse_event(text)?;

    let outbound = match event {
        UpstreamEvent::SessionCreated | UpstreamEvent::SessionUpdated => {
            debug!("Upstream session acknowledged");
            return None;
        }
        UpstreamEvent::SpeechStarted => {
            // Barge-in: the caller spoke over an in-flight response. Cancel
            // it and flush the buffered input so the new utterance starts
            // clean.
            let interrupted = {
                let mut state = state.write();
                if *state == AdapterState::Responding {
                    *state = AdapterState::Streaming;
                    true
                } else {
                    false
                }
            };
            if interrupted {
                debug!("Cancelling the in-flight response on barge-in");
                for request in [UpstreamRequest::ResponseCancel, UpstreamRequest::AudioClear] {
                    if sink
                        .send(Message::Text(request.to_wire().into()))
                        .await
                        .is_err()
                    {
                        return Some(PumpExit::Abnormal(
                            "barge-in cancel send failed".to_string(),
                        ));
                    }
                }
            }
            Some(AdapterEvent::TurnStarted)
        }
        UpstreamEvent::SpeechStopped => Some(AdapterEvent::TurnEnded),
        UpstreamEvent::ResponseCreated => {
            *state.write() = AdapterState::Responding;
            None
        }
        UpstreamEvent::ResponseDone => {
            let mut state = state.write();
            if *state == AdapterState::Responding {
                *state = AdapterState::Streaming;
            }
            None
        }
        UpstreamEvent::AudioDelta { delta } => match audio::wire_to_pcm16(&delta) {
            Ok(pcm) => Some(AdapterEvent::Audio(audio::pcm16_to_le_bytes(&pcm))),
            Err(e) => {
                // Per-frame loss: count it, keep the stream alive
                metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping malformed upstream audio delta: {e}");
                None
            }
        },
        UpstreamEvent::TranscriptDelta { delta } => Some(AdapterEvent::Transcript {
            text: delta,
            is_final: false,
            confidence: None,
        }),
        UpstreamEvent::TranscriptDone { transcript } => Some(AdapterEvent::Transcript {
            text: transcript,
            is_final: true,
            confidence: None,
        }),
        UpstreamEvent::InputTranscriptDone { transcript } => Some(AdapterEvent::Transcript {
            text: transcript,
            is_final: true,
            confidence: None,
        }),
        UpstreamEvent::FunctionCallDone {
            name,
            call_id,
            arguments,
        } => Some(AdapterEvent::FunctionCall {
            name,
            call_id,
            arguments,
        }),
        UpstreamEvent::Error { error } => {
            let err = VoiceError::UpstreamProtocol {
                code: error.code,
                message: error.message,
            };
            return Some(if err.is_retryable() {
                PumpExit::Abnormal(err.to_string())
            } else {
                PumpExit::Terminal(err)
            });
        }
    };

    if let Some(event) = outbound {
        if events_tx.send(event).await.is_err() {
            // Session side went away; stop pumping
            return Some(PumpExit::Shutdown);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> UpstreamConfig {
        UpstreamConfig {
            url: "ws://127.0.0.1:9".to_string(),
            api_key: Some("test-key".to_string()),
            model: "gpt-realtime".to_string(),
            instructions: "take orders".to_string(),
            voice: "alloy".to_string(),
            server_turn_detection: true,
            connect_timeout: Duration::from_millis(200),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            send_queue_frames: 4,
            tools: vec![],
        }
    }

    #[test]
    fn test_session_update_includes_server_vad() {
        let wire = session_update(&test_config());
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
    }

    #[test]
    fn test_session_update_disables_turn_detection_for_local_vad() {
        let config = UpstreamConfig {
            server_turn_detection: false,
            ..test_config()
        };
        let wire = session_update(&config);
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert!(value["session"]["turn_detection"].is_null());
    }

    #[tokio::test]
    async fn test_send_before_connect_drops_silently() {
        let (events_tx, _events_rx) = mpsc::channel(4);
        let adapter = UpstreamSpeechAdapter::new(test_config(), events_tx);
        assert_eq!(adapter.state(), AdapterState::Idle);

        adapter.send_audio(&[0i16; 480]);
        assert_eq!(adapter.metrics().frames_sent.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_connect_refused_leaves_adapter_closed() {
        let (events_tx, _events_rx) = mpsc::channel(4);
        let adapter = UpstreamSpeechAdapter::new(test_config(), events_tx);

        let result = adapter.connect().await;
        assert!(matches!(result, Err(VoiceError::Connection(_))));
        assert_eq!(adapter.state(), AdapterState::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (events_tx, _events_rx) = mpsc::channel(4);
        let adapter = UpstreamSpeechAdapter::new(test_config(), events_tx);
        adapter.disconnect().await;
        adapter.disconnect().await;
        assert_eq!(adapter.state(), AdapterState::Closed);
    }
}
