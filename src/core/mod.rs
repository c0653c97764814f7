//! Core voice-bridge logic, independent of any HTTP surface.

pub mod audio;
pub mod order;
pub mod session;
pub mod upstream;
pub mod vad;
