//! Shared helpers for integration tests: spawning the server on an ephemeral
//! port and faking the upstream speech API.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ordervox::{AppState, ServerConfig, routes};

pub type ServerSocket = WebSocketStream<TcpStream>;
pub type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Config tuned for fast tests: short timeouts, quick reconnects.
pub fn test_config(upstream_url: &str) -> ServerConfig {
    ServerConfig {
        upstream_url: upstream_url.to_string(),
        upstream_api_key: Some("test-key".to_string()),
        connect_timeout: Duration::from_millis(500),
        heartbeat_interval: Duration::from_secs(30),
        reconnect_max_attempts: 2,
        reconnect_base_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(50),
        ..ServerConfig::default()
    }
}

/// Start the bridge on an ephemeral port; returns its ws:// base URL and the
/// shared state for direct assertions.
pub async fn spawn_app(config: ServerConfig) -> (String, Arc<AppState>) {
    let state = AppState::new(config).expect("app state");
    let app = routes::create_app(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("ws://{addr}"), state)
}

/// Fake upstream speech API: every accepted connection is handed to the
/// given handler on its own task.
pub async fn spawn_mock_upstream<F, Fut>(handler: F) -> String
where
    F: Fn(ServerSocket) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    handler(ws).await;
                }
            });
        }
    });
    format!("ws://{addr}")
}

pub async fn connect(url: &str) -> ClientSocket {
    let (socket, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
    socket
}

pub async fn send_json(socket: &mut ClientSocket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("send");
}

/// Next JSON text frame within a deadline; panics on close or timeout.
pub async fn recv_json(socket: &mut ClientSocket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("frame is JSON");
        }
    }
}

/// Drain frames until the socket closes, returning the JSON text frames seen.
pub async fn drain_until_close(socket: &mut ClientSocket) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for close");
        match next {
            Some(Ok(Message::Text(text))) => {
                frames.push(serde_json::from_str(&text).expect("frame is JSON"));
            }
            Some(Ok(Message::Close(_))) | None => return frames,
            Some(Ok(_)) => {}
            Some(Err(_)) => return frames,
        }
    }
}

/// Poll until the condition holds or the deadline passes.
pub async fn wait_for(mut condition: impl FnMut() -> bool, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
