//! Voice WebSocket surface for browser/kiosk clients.

pub mod handler;
pub mod messages;

pub use handler::ws_voice_handler;
pub use messages::{IncomingMessage, OutgoingMessage};
