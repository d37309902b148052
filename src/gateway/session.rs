//! Per-connection gateway state.
//!
//! A session starts unauthenticated, is authenticated at most once, and is
//! closed at most once. All state sits behind interior locks so one
//! `Arc<GatewaySession>` can be shared by the reader loop, request tasks,
//! the heartbeat prober and the idle sweep.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;

use super::codec::{CodecError, MessageCodec};
use super::message::Message;
use crate::core::context::CallerInfo;

pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_SESSION_TIMEOUT: u16 = 4000;
pub const CLOSE_AUTH_TIMEOUT: u16 = 4002;
pub const CLOSE_AUTH_FAILED: u16 = 4003;
pub const CLOSE_MAX_CONNECTIONS: u16 = 4004;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Connection closed for session {0}")]
    Closed(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Outbound side of a transport connection.
pub trait Connection: Send + Sync + 'static {
    /// Queue a text frame.
    fn send(&self, text: String) -> Result<(), String>;

    /// Close with a WebSocket close code and reason.
    fn close(&self, code: u16, reason: &str);

    fn is_open(&self) -> bool;
}

#[derive(Debug)]
struct State {
    gateway_id: Option<String>,
    authenticated: bool,
    permissions: HashSet<String>,
    roles: HashSet<String>,
    last_activity_at: DateTime<Utc>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    failed_heartbeat_count: u32,
}

pub struct GatewaySession {
    id: String,
    connection: Arc<dyn Connection>,
    connected_at: DateTime<Utc>,
    state: RwLock<State>,
    closed: AtomicBool,
}

impl GatewaySession {
    pub fn new(id: impl Into<String>, connection: Arc<dyn Connection>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            connection,
            connected_at: now,
            state: RwLock::new(State {
                gateway_id: None,
                authenticated: false,
                permissions: HashSet::new(),
                roles: HashSet::new(),
                last_activity_at: now,
                last_heartbeat_at: None,
                failed_heartbeat_count: 0,
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn gateway_id(&self) -> Option<String> {
        self.state.read().gateway_id.clone()
    }

    /// Gateway id for log lines.
    pub fn display_name(&self) -> String {
        self.gateway_id().unwrap_or_else(|| format!("<unauthenticated {}>", self.id))
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().authenticated
    }

    pub fn permissions(&self) -> HashSet<String> {
        self.state.read().permissions.clone()
    }

    pub fn roles(&self) -> HashSet<String> {
        self.state.read().roles.clone()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.state.read().last_activity_at
    }

    pub fn last_heartbeat_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_heartbeat_at
    }

    pub fn failed_heartbeat_count(&self) -> u32 {
        self.state.read().failed_heartbeat_count
    }

    /// Record inbound or outbound traffic.
    pub fn touch(&self) {
        self.state.write().last_activity_at = Utc::now();
    }

    /// Move to Authenticated. Returns `false` if the session already was.
    ///
    /// The heartbeat clock starts here so a gateway that never acks still
    /// times out.
    pub fn authenticate(
        &self,
        gateway_id: impl Into<String>,
        permissions: HashSet<String>,
        roles: HashSet<String>,
    ) -> bool {
        let mut state = self.state.write();
        if state.authenticated {
            return false;
        }
        let now = Utc::now();
        state.gateway_id = Some(gateway_id.into());
        state.permissions = permissions;
        state.roles = roles;
        state.authenticated = true;
        state.last_heartbeat_at = Some(now);
        state.last_activity_at = now;
        true
    }

    pub fn record_heartbeat_ack(&self) {
        let mut state = self.state.write();
        state.last_heartbeat_at = Some(Utc::now());
        state.failed_heartbeat_count = 0;
    }

    /// Bump the missed-heartbeat counter and return its new value.
    pub fn increment_failed_heartbeats(&self) -> u32 {
        let mut state = self.state.write();
        state.failed_heartbeat_count += 1;
        state.failed_heartbeat_count
    }

    /// Identity used when this session invokes capabilities.
    pub fn caller_info(&self) -> Option<CallerInfo> {
        let state = self.state.read();
        let gateway_id = state.gateway_id.clone()?;
        Some(CallerInfo {
            id: gateway_id,
            permissions: state.permissions.clone(),
            roles: state.roles.clone(),
        })
    }

    pub fn send_text(&self, text: String) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        self.touch();
        self.connection.send(text).map_err(|e| {
            log::debug!("Send on session {} failed: {}", self.id, e);
            SessionError::Closed(self.id.clone())
        })
    }

    pub fn send(&self, codec: &MessageCodec, message: &Message) -> Result<(), SessionError> {
        let text = codec.encode(message)?;
        self.send_text(text)
    }

    /// Close the connection. Only the first call reaches the transport.
    pub fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("Closing session {} with code {}: {}", self.id, code, reason);
        self.connection.close(code, reason);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.connection.is_open()
    }
}

impl std::fmt::Debug for GatewaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("GatewaySession")
            .field("id", &self.id)
            .field("gateway_id", &state.gateway_id)
            .field("authenticated", &state.authenticated)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::Value;

    /// In-memory connection capturing frames and closes.
    pub(crate) struct RecordingConnection {
        pub sent: Mutex<Vec<String>>,
        pub closes: Mutex<Vec<(u16, String)>>,
        open: AtomicBool,
    }

    impl RecordingConnection {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                closes: Mutex::new(Vec::new()),
                open: AtomicBool::new(true),
            })
        }

        pub(crate) fn frames(&self) -> Vec<Value> {
            self.sent
                .lock()
                .iter()
                .map(|s| serde_json::from_str(s).unwrap())
                .collect()
        }

        pub(crate) fn close_codes(&self) -> Vec<u16> {
            self.closes.lock().iter().map(|(c, _)| *c).collect()
        }
    }

    impl Connection for RecordingConnection {
        fn send(&self, text: String) -> Result<(), String> {
            if !self.open.load(Ordering::SeqCst) {
                return Err("closed".into());
            }
            self.sent.lock().push(text);
            Ok(())
        }

        fn close(&self, code: u16, reason: &str) {
            self.open.store(false, Ordering::SeqCst);
            self.closes.lock().push((code, reason.to_string()));
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn session(id: &str) -> (Arc<GatewaySession>, Arc<RecordingConnection>) {
        let conn = RecordingConnection::new();
        (Arc::new(GatewaySession::new(id, conn.clone())), conn)
    }

    #[test]
    fn test_authenticates_once() {
        let (s, _) = session("s1");
        assert!(!s.is_authenticated());
        assert!(s.caller_info().is_none());
        assert!(s.authenticate("gw-1", HashSet::from(["p".to_string()]), HashSet::new()));
        assert!(!s.authenticate("gw-2", HashSet::new(), HashSet::new()));
        assert_eq!(s.gateway_id().as_deref(), Some("gw-1"));
        assert!(s.last_heartbeat_at().is_some());
        let caller = s.caller_info().unwrap();
        assert_eq!(caller.id, "gw-1");
        assert!(caller.has_permission("p"));
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_sends() {
        let (s, conn) = session("s1");
        s.send_text("hello".into()).unwrap();
        s.close(4000, "Session timeout");
        s.close(1001, "Server shutdown");
        assert_eq!(conn.close_codes(), vec![4000]);
        assert!(s.is_closed());
        assert!(matches!(s.send_text("x".into()), Err(SessionError::Closed(_))));
        assert_eq!(conn.sent.lock().len(), 1);
    }

    #[test]
    fn test_heartbeat_counters() {
        let (s, _) = session("s1");
        assert_eq!(s.increment_failed_heartbeats(), 1);
        assert_eq!(s.increment_failed_heartbeats(), 2);
        s.record_heartbeat_ack();
        assert_eq!(s.failed_heartbeat_count(), 0);
    }
}
