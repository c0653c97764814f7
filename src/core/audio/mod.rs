//! Audio transcoding and frame ordering for the voice bridge.

pub mod codec;
pub mod reorder;

pub use codec::{
    NARROWBAND_RATE, WIDEBAND_RATE, pcm16_from_le_bytes, pcm16_to_le_bytes, pcm16_to_wire,
    telephony_to_wideband, wideband_to_telephony, wire_to_pcm16,
};
pub use reorder::{AudioFrame, FrameSource, ReorderBuffer};
