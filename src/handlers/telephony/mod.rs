//! Carrier media-stream surface for phone calls.

pub mod bridge;
pub mod events;

pub use bridge::{TelephonyBridge, telephony_media_handler};
pub use events::TelephonyEvent;
