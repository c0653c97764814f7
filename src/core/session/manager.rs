//! Session table: the single source of truth for active sessions.
//!
//! Only this component mutates the map. Teardown runs exactly once per
//! session no matter which path triggers it (explicit stop, idle reaper,
//! fatal error); the per-session stop flag decides the winner.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::core::order::OrderToolRouter;
use crate::core::upstream::{AdapterEvent, UpstreamConfig, UpstreamSpeechAdapter};
use crate::errors::{VoiceError, VoiceResult};

use super::session::{SessionContext, SessionState, VoiceSession};

struct SessionEntry {
    session: Arc<VoiceSession>,
    /// None for loopback sessions, which never touch the upstream API.
    adapter: Option<Arc<UpstreamSpeechAdapter>>,
}

pub struct VoiceSessionManager {
    config: ServerConfig,
    sessions: SyncMutex<HashMap<String, SessionEntry>>,
    reaper: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl VoiceSessionManager {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            sessions: SyncMutex::new(HashMap::new()),
            reaper: SyncMutex::new(None),
        }
    }

    /// Create and register a session.
    ///
    /// The upstream connect happens before anything is registered, so a
    /// failed start leaves no partial state behind. Adapter events arrive on
    /// `events_tx`; the calling transport pump owns the receiving side.
    pub async fn start_session(
        &self,
        context: SessionContext,
        tenant_id: &str,
        loopback: bool,
        events_tx: mpsc::Sender<AdapterEvent>,
    ) -> VoiceResult<Arc<VoiceSession>> {
        let session_id = Uuid::new_v4().to_string();

        let adapter = if loopback {
            None
        } else {
            let upstream_config =
                UpstreamConfig::from_server(&self.config, OrderToolRouter::tool_schemas());
            let adapter = Arc::new(UpstreamSpeechAdapter::new(upstream_config, events_tx));
            adapter
                .connect()
                .await
                .map_err(|e| VoiceError::SessionStart(e.to_string()))?;
            Some(adapter)
        };

        let session = Arc::new(VoiceSession::new(
            session_id.clone(),
            tenant_id.to_string(),
            context,
        ));
        session.set_state(SessionState::Active);

        self.sessions.lock().insert(
            session_id.clone(),
            SessionEntry {
                session: session.clone(),
                adapter,
            },
        );
        info!(
            %session_id,
            tenant_id,
            context = context.as_str(),
            loopback,
            "Session started"
        );
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<VoiceSession>> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|e| e.session.clone())
    }

    pub fn adapter_for(&self, session_id: &str) -> Option<Arc<UpstreamSpeechAdapter>> {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|e| e.adapter.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Tear a session down: disconnect the upstream handle, mark the session
    /// ended, remove it from the table. Idempotent; the first caller wins and
    /// later callers return immediately.
    pub async fn stop_session(&self, session_id: &str) {
        let (session, adapter) = {
            let sessions = self.sessions.lock();
            match sessions.get(session_id) {
                Some(entry) => (entry.session.clone(), entry.adapter.clone()),
                None => {
                    debug!(session_id, "stop_session on unknown session");
                    return;
                }
            }
        };

        if !session.begin_stop() {
            debug!(session_id, "stop_session already in progress");
            return;
        }

        if let Some(adapter) = adapter {
            adapter.disconnect().await;
        }
        session.set_state(SessionState::Ended);
        self.sessions.lock().remove(session_id);
        info!(session_id, "Session stopped");
    }

    /// Start the background idle reaper. The returned task is stored and
    /// aborted on shutdown; it is never fire-and-forget.
    pub fn start_reaper(self: &Arc<Self>) {
        let manager = self.clone();
        let interval = self.config.session_reaper_interval;
        let idle_timeout = self.config.session_idle_timeout;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let expired: Vec<String> = manager
                    .sessions
                    .lock()
                    .values()
                    .filter(|e| e.session.idle_for() > idle_timeout)
                    .map(|e| e.session.session_id.clone())
                    .collect();
                for session_id in expired {
                    let reason = VoiceError::SessionTimeout(idle_timeout);
                    warn!(%session_id, "Reaping session: {reason}");
                    manager.stop_session(&session_id).await;
                }
            }
        });
        *self.reaper.lock() = Some(handle);
    }

    /// Graceful shutdown: cancel the reaper, then stop every session.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
        let session_ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        for session_id in session_ids {
            self.stop_session(&session_id).await;
        }
    }
}

impl Drop for VoiceSessionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> Arc<VoiceSessionManager> {
        Arc::new(VoiceSessionManager::new(ServerConfig::default()))
    }

    #[tokio::test]
    async fn test_loopback_session_registers_without_adapter() {
        let manager = manager();
        let (tx, _rx) = mpsc::channel(4);
        let session = manager
            .start_session(SessionContext::Kiosk, "default", true, tx)
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(manager.session_count(), 1);
        assert!(manager.adapter_for(&session.session_id).is_none());
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_partial_state() {
        let config = ServerConfig {
            upstream_url: "ws://127.0.0.1:9".to_string(),
            connect_timeout: Duration::from_millis(200),
            ..ServerConfig::default()
        };
        let manager = Arc::new(VoiceSessionManager::new(config));
        let (tx, _rx) = mpsc::channel(4);

        let result = manager
            .start_session(SessionContext::Kiosk, "default", false, tx)
            .await;
        assert!(matches!(result, Err(VoiceError::SessionStart(_))));
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_session_is_idempotent() {
        let manager = manager();
        let (tx, _rx) = mpsc::channel(4);
        let session = manager
            .start_session(SessionContext::Staff, "default", true, tx)
            .await
            .unwrap();
        let id = session.session_id.clone();

        manager.stop_session(&id).await;
        assert_eq!(manager.session_count(), 0);
        assert_eq!(session.state(), SessionState::Ended);

        // Second stop finds nothing and changes nothing
        manager.stop_session(&id).await;
        assert_eq!(manager.session_count(), 0);
        assert_eq!(session.state(), SessionState::Ended);
    }

    #[tokio::test]
    async fn test_reaper_reclaims_idle_sessions() {
        let config = ServerConfig {
            session_idle_timeout: Duration::from_millis(50),
            session_reaper_interval: Duration::from_millis(25),
            ..ServerConfig::default()
        };
        let manager = Arc::new(VoiceSessionManager::new(config));
        let (tx, _rx) = mpsc::channel(4);
        manager
            .start_session(SessionContext::Kiosk, "default", true, tx)
            .await
            .unwrap();
        manager.start_reaper();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.session_count(), 0);
        manager.shutdown().await;
    }
}
