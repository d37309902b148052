//! Liveness probing for authenticated gateway sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::codec::MessageCodec;
use super::message::{HeartbeatPayload, HostStatus, Message, Payload};
use super::session::{GatewaySession, CLOSE_SESSION_TIMEOUT};
use super::session_manager::SessionManager;
use crate::config::WebSocketServerConfig;

/// Supplies the host snapshot carried by each heartbeat.
///
/// `connected_gateways` is overwritten with the live session count.
pub trait HostStatusProvider: Send + Sync + 'static {
    fn snapshot(&self) -> HostStatus;
}

/// Reports a healthy, idle host.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHostStatus;

impl HostStatusProvider for DefaultHostStatus {
    fn snapshot(&self) -> HostStatus {
        HostStatus {
            healthy: true,
            tps: 20.0,
            online_units: 0,
            memory_usage: 0.0,
            connected_gateways: 0,
        }
    }
}

pub struct HeartbeatHandler {
    sessions: Arc<SessionManager>,
    status: Arc<dyn HostStatusProvider>,
    codec: MessageCodec,
    interval: Duration,
    timeout: Duration,
    max_retries: u32,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatHandler {
    pub fn new(
        sessions: Arc<SessionManager>,
        status: Arc<dyn HostStatusProvider>,
        interval: Duration,
        timeout: Duration,
        max_retries: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            status,
            codec: MessageCodec::new(),
            interval,
            timeout,
            max_retries,
            task: Mutex::new(None),
        })
    }

    pub fn from_config(
        sessions: Arc<SessionManager>,
        status: Arc<dyn HostStatusProvider>,
        ws: &WebSocketServerConfig,
    ) -> Arc<Self> {
        Self::new(
            sessions,
            status,
            ws.heartbeat_interval(),
            ws.heartbeat_timeout(),
            ws.max_retries,
        )
    }

    /// Start probing every `interval`.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(handler) = weak.upgrade() else { break };
                handler.tick();
            }
        });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        log::info!(
            "Heartbeat started (interval {:?}, timeout {:?}, max retries {})",
            self.interval,
            self.timeout,
            self.max_retries
        );
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            log::debug!("Heartbeat stopped");
        }
    }

    /// Run one probe round. Returns how many sessions were closed.
    pub fn tick(&self) -> usize {
        self.tick_at(Utc::now())
    }

    pub fn tick_at(&self, now: DateTime<Utc>) -> usize {
        let mut closed = 0;
        for session in self.sessions.authenticated_sessions() {
            if self.probe(&session, now) {
                closed += 1;
            }
        }
        closed
    }

    /// Returns `true` when the session was torn down.
    fn probe(&self, session: &Arc<GatewaySession>, now: DateTime<Utc>) -> bool {
        let overdue = session
            .last_heartbeat_at()
            .and_then(|last| (now - last).to_std().ok())
            .map(|elapsed| elapsed > self.timeout)
            .unwrap_or(false);

        if overdue {
            let failures = session.increment_failed_heartbeats();
            if failures > self.max_retries {
                log::warn!(
                    "Gateway {} missed {} heartbeats, closing session {}",
                    session.display_name(),
                    failures,
                    session.id()
                );
                session.close(CLOSE_SESSION_TIMEOUT, "Heartbeat timeout exceeded max retries");
                self.sessions.remove_session(session.id());
                return true;
            }
            log::warn!(
                "Heartbeat timeout for gateway {} ({}/{})",
                session.display_name(),
                failures,
                self.max_retries
            );
        }

        let mut status = self.status.snapshot();
        status.connected_gateways = self.sessions.stats().authenticated_sessions;
        let heartbeat = Message::new(Payload::Heartbeat(HeartbeatPayload {
            gateway_id: session.gateway_id(),
            timestamp: now,
            status: Some(status),
        }));
        if let Err(e) = session.send(&self.codec, &heartbeat) {
            log::debug!("Failed to send heartbeat to session {}: {}", session.id(), e);
        }
        false
    }

    pub fn on_heartbeat_ack(&self, session: &GatewaySession) {
        session.record_heartbeat_ack();
        log::trace!("Heartbeat ack from gateway {}", session.display_name());
    }
}

impl std::fmt::Debug for HeartbeatHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatHandler")
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::tests::session;
    use crate::gateway::session_manager::SessionManagerConfig;
    use std::collections::HashSet;

    fn setup(max_retries: u32) -> (Arc<SessionManager>, Arc<HeartbeatHandler>) {
        let manager = SessionManager::new(SessionManagerConfig {
            max_connections: 0,
            ..SessionManagerConfig::default()
        });
        let handler = HeartbeatHandler::new(
            manager.clone(),
            Arc::new(DefaultHostStatus),
            Duration::from_secs(30),
            Duration::from_secs(90),
            max_retries,
        );
        (manager, handler)
    }

    #[tokio::test]
    async fn test_heartbeat_sent_with_status() {
        let (manager, handler) = setup(3);
        let (s, conn) = session("s1");
        manager.add_session(s.clone());
        s.authenticate("gw-1", HashSet::new(), HashSet::new());
        manager.mark_authenticated(&s);

        assert_eq!(handler.tick(), 0);
        let frames = conn.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "heartbeat");
        assert_eq!(frames[0]["payload"]["gatewayId"], "gw-1");
        assert_eq!(frames[0]["payload"]["status"]["connectedGateways"], 1);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_unauthenticated_sessions_are_not_probed() {
        let (manager, handler) = setup(3);
        let (s, conn) = session("s1");
        manager.add_session(s);
        handler.tick();
        assert!(conn.frames().is_empty());
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_missed_beats_close_after_max_retries() {
        let (manager, handler) = setup(2);
        let (s, conn) = session("s1");
        manager.add_session(s.clone());
        s.authenticate("gw-1", HashSet::new(), HashSet::new());
        manager.mark_authenticated(&s);

        let late = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(handler.tick_at(late), 0);
        assert_eq!(handler.tick_at(late), 0);
        assert_eq!(s.failed_heartbeat_count(), 2);
        assert!(conn.close_codes().is_empty());

        assert_eq!(handler.tick_at(late), 1);
        assert_eq!(conn.close_codes(), vec![CLOSE_SESSION_TIMEOUT]);
        assert!(manager.get_session("s1").is_none());

        // Already removed, so a further round does nothing.
        assert_eq!(handler.tick_at(late), 0);
        assert_eq!(conn.close_codes().len(), 1);
    }

    #[tokio::test]
    async fn test_ack_resets_counter() {
        let (manager, handler) = setup(2);
        let (s, conn) = session("s1");
        manager.add_session(s.clone());
        s.authenticate("gw-1", HashSet::new(), HashSet::new());
        manager.mark_authenticated(&s);

        let late = Utc::now() + chrono::Duration::seconds(120);
        handler.tick_at(late);
        handler.tick_at(late);
        handler.on_heartbeat_ack(&s);
        assert_eq!(s.failed_heartbeat_count(), 0);

        assert_eq!(handler.tick(), 0);
        assert!(conn.close_codes().is_empty());
        manager.shutdown();
    }
}
