//! MCP session lifecycle.
//!
//! Sessions are keyed by the transport's session header and move strictly
//! forward: Initializing, Initialized, Operating, ShuttingDown, Closed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

/// Idle time after which a session is dropped by the sweep.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(300);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Initialized,
    Operating,
    ShuttingDown,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Operating => "operating",
            Self::ShuttingDown => "shutting_down",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub state: SessionState,
    pub protocol_version: Option<String>,
    pub client_capabilities: Option<Value>,
    pub client_info: Option<Value>,
    pub server_capabilities: Option<Value>,
    pub server_info: Option<Value>,
    pub instructions: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            state: SessionState::Initializing,
            protocol_version: None,
            client_capabilities: None,
            client_info: None,
            server_capabilities: None,
            server_info: None,
            instructions: None,
            created_at: now,
            last_activity: now,
        }
    }

    /// Move to `next`. Backward or same-state moves are refused.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if next <= self.state {
            log::warn!(
                "Refusing MCP session {} transition {} -> {}",
                self.session_id,
                self.state,
                next
            );
            return false;
        }
        self.state = next;
        self.touch();
        true
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        (now - self.last_activity)
            .to_std()
            .map(|idle| idle > timeout)
            .unwrap_or(false)
    }

    /// Client name from `clientInfo`, for logging.
    pub fn client_name(&self) -> &str {
        self.client_info
            .as_ref()
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }
}

/// Concurrent store of MCP sessions with an idle sweep.
pub struct McpSessionManager {
    sessions: DashMap<String, SessionInfo>,
    timeout: Duration,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl McpSessionManager {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            timeout,
            cleanup: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut cleanup = self.cleanup.lock();
        if cleanup.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *cleanup = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.cleanup_expired();
            }
        }));
        log::info!("MCP session manager started");
    }

    /// Stop the sweep and drop every session.
    pub fn stop(&self) {
        if let Some(task) = self.cleanup.lock().take() {
            task.abort();
        }
        self.sessions.clear();
        log::info!("MCP session manager stopped");
    }

    pub fn create_session(&self, session_id: &str) -> SessionInfo {
        let session = SessionInfo::new(session_id);
        self.sessions.insert(session_id.to_string(), session.clone());
        log::debug!("Created MCP session: {}", session_id);
        session
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    /// Mutate a session in place, creating it first if unknown.
    pub fn with_session<R>(&self, session_id: &str, f: impl FnOnce(&mut SessionInfo) -> R) -> R {
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                log::debug!("Created MCP session: {}", session_id);
                SessionInfo::new(session_id)
            });
        f(entry.value_mut())
    }

    /// Mutate an existing session. `None` if it is unknown.
    pub fn update_session<R>(&self, session_id: &str, f: impl FnOnce(&mut SessionInfo) -> R) -> Option<R> {
        self.sessions.get_mut(session_id).map(|mut s| f(s.value_mut()))
    }

    pub fn remove_session(&self, session_id: &str) -> Option<SessionInfo> {
        let removed = self.sessions.remove(session_id).map(|(_, s)| s);
        if removed.is_some() {
            log::debug!("Removed MCP session: {}", session_id);
        }
        removed
    }

    pub fn update_activity(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.touch();
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_session_ready(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| s.state == SessionState::Operating)
            .unwrap_or(false)
    }

    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        let timeout = self.timeout;
        self.sessions.retain(|id, session| {
            let expired = session.is_expired_at(now, timeout);
            if expired {
                log::debug!("Cleaning up expired MCP session: {}", id);
            }
            !expired
        });
        before.saturating_sub(self.sessions.len())
    }
}

impl std::fmt::Debug for McpSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSessionManager")
            .field("sessions", &self.sessions.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
