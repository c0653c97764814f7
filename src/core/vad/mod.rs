//! Energy-based voice activity detection.
//!
//! Used only when the session runs local turn detection; under server-side
//! turn detection the upstream API owns end-of-utterance and this module is
//! bypassed entirely.

mod energy;

pub use energy::{EnergyVad, EnergyVadConfig, TurnGate};
