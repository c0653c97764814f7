//! Per-session record: identity, lifecycle state, order draft, and metrics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use serde_json::{Value, json};

use crate::core::order::OrderDraft;

/// Where the session's audio comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionContext {
    Kiosk,
    Staff,
}

impl SessionContext {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "kiosk" => Some(SessionContext::Kiosk),
            "staff" => Some(SessionContext::Staff),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionContext::Kiosk => "kiosk",
            SessionContext::Staff => "staff",
        }
    }
}

/// Session lifecycle as exposed to the external order system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    OrderDrafting,
    OrderConfirmed,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::OrderDrafting => "order_drafting",
            SessionState::OrderConfirmed => "order_confirmed",
            SessionState::Ended => "ended",
        }
    }
}

/// Cumulative per-session counters, updated lock-free from the audio path.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub audio_ms_processed: AtomicU64,
    pub transcript_count: AtomicU64,
    pub error_count: AtomicU64,
    pub reconnect_count: AtomicU64,
    pub frames_dropped: AtomicU64,
}

impl SessionMetrics {
    pub fn snapshot(&self) -> Value {
        json!({
            "audio_ms_processed": self.audio_ms_processed.load(Ordering::Relaxed),
            "transcript_count": self.transcript_count.load(Ordering::Relaxed),
            "error_count": self.error_count.load(Ordering::Relaxed),
            "reconnect_count": self.reconnect_count.load(Ordering::Relaxed),
            "frames_dropped": self.frames_dropped.load(Ordering::Relaxed),
        })
    }
}

/// One live voice session. Owns exactly one order draft; the upstream
/// connection handle lives beside it in the manager's table.
pub struct VoiceSession {
    pub session_id: String,
    pub tenant_id: String,
    pub context: SessionContext,
    pub created_at: Instant,
    state: SyncRwLock<SessionState>,
    last_activity: SyncRwLock<Instant>,
    draft: SyncMutex<OrderDraft>,
    pub metrics: SessionMetrics,
    stopping: AtomicBool,
}

impl VoiceSession {
    pub fn new(session_id: String, tenant_id: String, context: SessionContext) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            tenant_id,
            context,
            created_at: now,
            state: SyncRwLock::new(SessionState::Created),
            last_activity: SyncRwLock::new(now),
            draft: SyncMutex::new(OrderDraft::new()),
            metrics: SessionMetrics::default(),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Advance the lifecycle state. `Ended` is terminal; transitions out of it
    /// are ignored so late events cannot resurrect a torn-down session.
    pub fn set_state(&self, next: SessionState) {
        let mut state = self.state.write();
        if *state != SessionState::Ended {
            *state = next;
        }
    }

    /// Record activity for the idle reaper.
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Run a closure against the draft under its lock. All mutation flows
    /// through here, keeping per-session function calls serialized.
    pub fn with_draft<T>(&self, f: impl FnOnce(&mut OrderDraft) -> T) -> T {
        f(&mut self.draft.lock())
    }

    pub fn draft_snapshot(&self) -> OrderDraft {
        self.draft.lock().clone()
    }

    /// Claim the right to tear this session down. Only the first caller wins.
    pub fn begin_stop(&self) -> bool {
        self.stopping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> VoiceSession {
        VoiceSession::new(
            "s1".to_string(),
            "default".to_string(),
            SessionContext::Kiosk,
        )
    }

    #[test]
    fn test_ended_is_terminal() {
        let s = session();
        s.set_state(SessionState::Active);
        s.set_state(SessionState::Ended);
        s.set_state(SessionState::Active);
        assert_eq!(s.state(), SessionState::Ended);
    }

    #[test]
    fn test_begin_stop_single_winner() {
        let s = session();
        assert!(s.begin_stop());
        assert!(!s.begin_stop());
    }

    #[test]
    fn test_touch_resets_idle_clock() {
        let s = session();
        std::thread::sleep(Duration::from_millis(20));
        assert!(s.idle_for() >= Duration::from_millis(20));
        s.touch();
        assert!(s.idle_for() < Duration::from_millis(20));
    }

    #[test]
    fn test_context_parse() {
        assert_eq!(SessionContext::parse("KIOSK"), Some(SessionContext::Kiosk));
        assert_eq!(SessionContext::parse("staff"), Some(SessionContext::Staff));
        assert_eq!(SessionContext::parse("drive-thru"), None);
    }
}
