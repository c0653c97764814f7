//! Session lifecycle: per-session records and the process-wide manager.

pub mod manager;
pub mod session;

pub use manager::VoiceSessionManager;
pub use session::{SessionContext, SessionMetrics, SessionState, VoiceSession};
