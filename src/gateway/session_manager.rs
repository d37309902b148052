//! Tracks gateway sessions in two indices: every live session by session id,
//! and authenticated sessions by gateway id.
//!
//! The indices are independent concurrent maps. A session may briefly appear
//! in one and not the other while it transitions; readers must not assume
//! the two agree.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use super::session::{
    GatewaySession, CLOSE_AUTH_TIMEOUT, CLOSE_GOING_AWAY, CLOSE_MAX_CONNECTIONS,
    CLOSE_SESSION_TIMEOUT,
};
use crate::config::WebSocketServerConfig;

pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Zero disables the limit.
    pub max_connections: usize,
    pub session_timeout: Duration,
    pub auth_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1,
            session_timeout: Duration::from_secs(300),
            auth_timeout: AUTH_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

impl SessionManagerConfig {
    pub fn from_config(ws: &WebSocketServerConfig) -> Self {
        Self {
            max_connections: ws.max_connections,
            session_timeout: ws.session_timeout(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total_sessions: usize,
    pub authenticated_sessions: usize,
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<GatewaySession>>,
    by_gateway: DashMap<String, Arc<GatewaySession>>,
    auth_timers: DashMap<String, JoinHandle<()>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    admission: Mutex<()>,
    config: SessionManagerConfig,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            by_gateway: DashMap::new(),
            auth_timers: DashMap::new(),
            sweeper: Mutex::new(None),
            admission: Mutex::new(()),
            config,
        })
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    /// Start the periodic idle sweep.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.sweep_idle();
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Admit a new connection. Over the limit, the session is closed with
    /// 4004 and `false` is returned.
    pub fn add_session(self: &Arc<Self>, session: Arc<GatewaySession>) -> bool {
        {
            let _admission = self.admission.lock();
            let max = self.config.max_connections;
            if max > 0 && self.sessions.len() >= max {
                log::warn!("Maximum connections reached ({}), rejecting session {}", max, session.id());
                session.close(CLOSE_MAX_CONNECTIONS, "Maximum connections reached");
                return false;
            }
            self.sessions.insert(session.id().to_string(), session.clone());
        }
        log::debug!("Added session {}", session.id());

        let weak: Weak<Self> = Arc::downgrade(self);
        let budget = self.config.auth_timeout;
        let pending = session.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            if pending.is_authenticated() {
                return;
            }
            log::warn!("Session {} authentication timeout, closing connection", pending.id());
            pending.close(CLOSE_AUTH_TIMEOUT, "Authentication timeout");
            if let Some(manager) = weak.upgrade() {
                manager.auth_timers.remove(pending.id());
                manager.remove_session(pending.id());
            }
        });
        self.auth_timers.insert(session.id().to_string(), timer);
        true
    }

    /// Index an authenticated session by gateway id.
    ///
    /// A live session already holding the same gateway id is closed and
    /// removed first.
    pub fn mark_authenticated(&self, session: &Arc<GatewaySession>) {
        let Some(gateway_id) = session.gateway_id() else {
            log::warn!("Session {} marked authenticated without a gateway id", session.id());
            return;
        };
        if let Some((_, timer)) = self.auth_timers.remove(session.id()) {
            timer.abort();
        }
        let previous = self.by_gateway.insert(gateway_id.clone(), session.clone());
        if let Some(previous) = previous.filter(|p| p.id() != session.id()) {
            log::warn!(
                "Gateway {} re-connected, replacing session {} with {}",
                gateway_id,
                previous.id(),
                session.id()
            );
            previous.close(CLOSE_SESSION_TIMEOUT, "Session replaced");
            self.sessions.remove(previous.id());
        }
        log::info!(
            "Gateway {} authenticated successfully with {} permissions",
            gateway_id,
            session.permissions().len()
        );
    }

    /// Remove a session from both indices. Unknown ids are a no-op.
    pub fn remove_session(&self, session_id: &str) -> Option<Arc<GatewaySession>> {
        if let Some((_, timer)) = self.auth_timers.remove(session_id) {
            timer.abort();
        }
        let (_, session) = self.sessions.remove(session_id)?;
        if let Some(gateway_id) = session.gateway_id() {
            self.by_gateway
                .remove_if(&gateway_id, |_, indexed| Arc::ptr_eq(indexed, &session));
        }
        log::debug!("Removed session {} for gateway {}", session_id, session.display_name());
        Some(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<GatewaySession>> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn get_session_by_gateway_id(&self, gateway_id: &str) -> Option<Arc<GatewaySession>> {
        self.by_gateway.get(gateway_id).map(|s| s.value().clone())
    }

    pub fn authenticated_sessions(&self) -> Vec<Arc<GatewaySession>> {
        self.by_gateway.iter().map(|e| e.value().clone()).collect()
    }

    pub fn all_sessions(&self) -> Vec<Arc<GatewaySession>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            total_sessions: self.sessions.len(),
            authenticated_sessions: self.by_gateway.len(),
        }
    }

    /// Close and drop sessions idle for longer than the session timeout.
    /// Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        let now = Utc::now();
        let timeout = self.config.session_timeout;
        let stale: Vec<Arc<GatewaySession>> = self
            .sessions
            .iter()
            .filter(|e| {
                (now - e.value().last_activity_at())
                    .to_std()
                    .map(|idle| idle > timeout)
                    .unwrap_or(false)
            })
            .map(|e| e.value().clone())
            .collect();

        for session in &stale {
            log::debug!("Removing stale session {}", session.id());
            session.close(CLOSE_SESSION_TIMEOUT, "Session timeout");
            self.remove_session(session.id());
        }
        stale.len()
    }

    /// Close every session with 1001 and clear both indices.
    pub fn close_all_sessions(&self, reason: &str) {
        for session in self.all_sessions() {
            session.close(CLOSE_GOING_AWAY, reason);
        }
        self.sessions.clear();
        self.by_gateway.clear();
        log::info!("Closed all sessions: {}", reason);
    }

    /// Stop the sweep and every pending authentication timer.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        let ids: Vec<String> = self.auth_timers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, timer)) = self.auth_timers.remove(&id) {
                timer.abort();
            }
        }
        log::debug!("Session manager stopped");
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("stats", &self.stats())
            .field("config", &self.config)
            .finish()
    }
}
