use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::{telephony, ws};
use crate::state::AppState;
use std::sync::Arc;

/// Create the WebSocket router.
///
/// Both endpoints are unauthenticated by design: sessions carry no durable
/// data and the deployment fronts them with a proxy that owns access control.
/// The carrier gateway additionally signs its media streams at the network
/// layer.
pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws", get(ws::ws_voice_handler))
        .route("/telephony/media", get(telephony::telephony_media_handler))
        .layer(TraceLayer::new_for_http())
}
