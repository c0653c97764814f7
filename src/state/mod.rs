use std::sync::Arc;

use tracing::info;

use crate::config::ServerConfig;
use crate::core::order::{LogOrderSink, MenuLookup, OrderSink, OrderToolRouter, StaticMenu};
use crate::core::session::VoiceSessionManager;
use crate::errors::VoiceResult;
use crate::handlers::telephony::TelephonyBridge;

/// Application state that can be shared across handlers
pub struct AppState {
    pub config: ServerConfig,
    /// Session table and idle reaper
    pub sessions: Arc<VoiceSessionManager>,
    /// Carrier stream registry and sweeper
    pub bridge: Arc<TelephonyBridge>,
    /// Function-call routing onto order drafts
    pub order_router: Arc<OrderToolRouter>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> VoiceResult<Arc<Self>> {
        Self::with_sink(config, Arc::new(LogOrderSink))
    }

    /// Build state with a custom order sink; used by tests to observe
    /// confirmed orders.
    pub fn with_sink(config: ServerConfig, sink: Arc<dyn OrderSink>) -> VoiceResult<Arc<Self>> {
        let menu: Arc<dyn MenuLookup> = match &config.menu_path {
            Some(path) => Arc::new(StaticMenu::from_file(path)?),
            None => {
                info!("No menu file configured; using the built-in sample menu");
                Arc::new(StaticMenu::sample(&config.default_tenant))
            }
        };
        let order_router = Arc::new(OrderToolRouter::new(menu, sink, config.free_text_cap));

        let sessions = Arc::new(VoiceSessionManager::new(config.clone()));
        sessions.start_reaper();
        let bridge = Arc::new(TelephonyBridge::new(config.clone()));
        bridge.start_sweeper();

        Ok(Arc::new(Self {
            config,
            sessions,
            bridge,
            order_router,
        }))
    }

    /// Graceful shutdown: cancel background timers, close streams, stop
    /// every session.
    pub async fn shutdown(&self) {
        self.bridge.shutdown().await;
        self.sessions.shutdown().await;
    }
}
