//! Routes decoded gateway frames: authentication, heartbeat acks and
//! capability requests.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::auth::{AuthHandler, AuthResult};
use super::codec::MessageCodec;
use super::heartbeat::HeartbeatHandler;
use super::message::*;
use super::session::{Connection, GatewaySession, SessionError, CLOSE_AUTH_FAILED};
use super::session_manager::SessionManager;
use crate::config::AgentConfig;
use crate::core::{ExecutionEngine, ExecutionResponse};
use crate::error::ErrorCode;

pub struct GatewayDispatcher {
    sessions: Arc<SessionManager>,
    auth: AuthHandler,
    engine: Arc<ExecutionEngine>,
    heartbeat: Arc<HeartbeatHandler>,
    codec: MessageCodec,
    agent_info: AgentInfoPayload,
    client_config: ClientConfig,
}

impl GatewayDispatcher {
    pub fn new(
        sessions: Arc<SessionManager>,
        auth: AuthHandler,
        engine: Arc<ExecutionEngine>,
        heartbeat: Arc<HeartbeatHandler>,
        agent_info: AgentInfoPayload,
        client_config: ClientConfig,
    ) -> Self {
        Self {
            sessions,
            auth,
            engine,
            heartbeat,
            codec: MessageCodec::new(),
            agent_info,
            client_config,
        }
    }

    pub fn from_config(
        config: &AgentConfig,
        sessions: Arc<SessionManager>,
        engine: Arc<ExecutionEngine>,
        heartbeat: Arc<HeartbeatHandler>,
    ) -> Self {
        let agent = &config.agent_info;
        let host = &config.server_info;
        let ws = &config.websocket_server;
        Self::new(
            sessions,
            AuthHandler::from_config(config),
            engine,
            heartbeat,
            AgentInfoPayload {
                id: agent.agent_id.clone(),
                name: agent.agent_name.clone(),
                version: agent.agent_version.clone(),
                environment: agent.environment.clone(),
                server_info: HostInfo {
                    name: host.name.clone(),
                    server_type: host.server_type.clone(),
                    version: host.version.clone(),
                    max_players: host.max_players,
                },
            },
            ClientConfig {
                heartbeat_interval: ws.heartbeat_interval,
                reconnect_delay: ws.reconnect_delay,
                max_retries: ws.max_retries,
            },
        )
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Register a freshly accepted connection. `None` when the session limit
    /// turned it away.
    pub fn open_session(&self, connection: Arc<dyn Connection>) -> Option<Arc<GatewaySession>> {
        let session = Arc::new(GatewaySession::new(uuid::Uuid::new_v4().to_string(), connection));
        if self.sessions.add_session(session.clone()) {
            log::info!("Gateway connection opened: session {}", session.id());
            Some(session)
        } else {
            None
        }
    }

    pub fn close_session(&self, session_id: &str) {
        if let Some(session) = self.sessions.remove_session(session_id) {
            log::info!(
                "Gateway connection closed: session {} ({})",
                session_id,
                session.display_name()
            );
        }
    }

    /// Handle one inbound text frame.
    ///
    /// Capability requests run on their own task, whose handle is returned.
    pub fn handle_text(&self, session: &Arc<GatewaySession>, text: &str) -> Option<JoinHandle<()>> {
        session.touch();
        match self.codec.decode(text) {
            Ok(message) => self.dispatch(session, message),
            Err(e) => {
                log::warn!(
                    "[{}] Dropping frame from session {}: {}",
                    e.code(),
                    session.id(),
                    e
                );
                None
            }
        }
    }

    pub fn dispatch(&self, session: &Arc<GatewaySession>, message: Message) -> Option<JoinHandle<()>> {
        let message_id = message.id;
        match message.payload {
            Payload::Auth(auth) => {
                self.handle_auth(session, &message_id, auth);
                None
            }
            Payload::HeartbeatAck(_) => {
                self.heartbeat.on_heartbeat_ack(session);
                None
            }
            Payload::Request(request) => self.handle_request(session, request),
            other => {
                log::debug!(
                    "Unhandled message type {} from session {}",
                    other.message_type(),
                    session.id()
                );
                None
            }
        }
    }

    fn handle_auth(&self, session: &Arc<GatewaySession>, message_id: &str, auth: AuthPayload) {
        if session.is_authenticated() {
            log::warn!(
                "Session {} is already authenticated as {}, ignoring auth for {}",
                session.id(),
                session.display_name(),
                auth.gateway_id
            );
            return;
        }

        match self.auth.authenticate(&auth.gateway_id, &auth.token) {
            AuthResult::Success { permissions, roles } => {
                let granted: BTreeSet<String> = permissions.iter().cloned().collect();
                if !session.authenticate(auth.gateway_id.clone(), permissions, roles) {
                    log::warn!("Session {} authenticated concurrently, ignoring", session.id());
                    return;
                }
                self.sessions.mark_authenticated(session);

                let response = AuthResponsePayload {
                    success: true,
                    gateway_id: Some(auth.gateway_id),
                    session_id: Some(session.id().to_string()),
                    agent_info: Some(self.agent_info.clone()),
                    reason: None,
                    permissions: granted,
                    capabilities: self.engine.registry().get_capabilities(),
                    config: Some(self.client_config),
                };
                let reply = Message::new(Payload::AuthResponse(response)).correlated(message_id);
                if let Err(e) = session.send(&self.codec, &reply) {
                    log::warn!("Failed to send auth response to session {}: {}", session.id(), e);
                }
            }
            AuthResult::Failure { reason } => {
                let reply = Message::new(Payload::AuthResponse(AuthResponsePayload::failure(
                    auth.gateway_id,
                    reason,
                )))
                .correlated(message_id);
                if let Err(e) = session.send(&self.codec, &reply) {
                    log::debug!("Failed to send auth failure to session {}: {}", session.id(), e);
                }
                session.close(CLOSE_AUTH_FAILED, "Authentication failed");
                self.sessions.remove_session(session.id());
            }
        }
    }

    fn handle_request(
        &self,
        session: &Arc<GatewaySession>,
        request: crate::core::ExecutionRequest,
    ) -> Option<JoinHandle<()>> {
        let Some(caller) = session.caller_info().filter(|_| session.is_authenticated()) else {
            log::warn!(
                "Rejecting request {} for {} from unauthenticated session {}",
                request.id,
                request.capability_id,
                session.id()
            );
            let response = ExecutionResponse::error(
                &request.id,
                ErrorCode::AuthenticationFailed,
                "Session is not authenticated",
            );
            if let Err(e) = session.send(&self.codec, &Message::response(response)) {
                log::debug!("Failed to send rejection to session {}: {}", session.id(), e);
            }
            return None;
        };

        log::debug!(
            "Request {} from gateway {} for capability {}",
            request.id,
            caller.id,
            request.capability_id
        );
        let engine = self.engine.clone();
        let session = session.clone();
        let codec = self.codec;
        Some(tokio::spawn(async move {
            let response = engine.execute(request, Some(caller)).await;
            if let Err(e) = session.send(&codec, &Message::response(response)) {
                log::warn!("Failed to deliver response to session {}: {}", session.id(), e);
            }
        }))
    }

    pub fn send(&self, session_id: &str, message: &Message) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_session(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.send(&self.codec, message)
    }

    /// Send to every authenticated session. Returns the number reached.
    pub fn broadcast(&self, message: &Message) -> usize {
        let mut delivered = 0;
        for session in self.sessions.authenticated_sessions() {
            match session.send(&self.codec, message) {
                Ok(()) => delivered += 1,
                Err(e) => log::warn!("Broadcast to {} failed: {}", session.display_name(), e),
            }
        }
        delivered
    }

    /// Close every session and stop background work.
    pub fn stop(&self) {
        self.heartbeat.stop();
        self.sessions.close_all_sessions("Server shutdown");
        self.sessions.shutdown();
    }
}

impl std::fmt::Debug for GatewayDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayDispatcher")
            .field("sessions", &self.sessions)
            .field("open_auth", &self.auth.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::capability::CapabilitySpec;
    use crate::capabilities::registry::tests::StaticProvider;
    use crate::capabilities::CapabilityRegistry;
    use crate::gateway::heartbeat::DefaultHostStatus;
    use crate::gateway::session::tests::RecordingConnection;
    use crate::gateway::session::CLOSE_GOING_AWAY;
    use crate::gateway::session_manager::SessionManagerConfig;
    use crate::policy::PermissionChecker;
    use serde_json::{json, Value};

    fn dispatcher() -> GatewayDispatcher {
        let registry = Arc::new(CapabilityRegistry::new());
        registry
            .register(
                StaticProvider::new(
                    "world",
                    vec![CapabilitySpec::context("world.time.get", "Get world time")],
                ),
                "core",
            )
            .unwrap();
        let engine = Arc::new(ExecutionEngine::new(registry, vec![Arc::new(PermissionChecker::new())]));
        let config = AgentConfig::default();
        let sessions = SessionManager::new(SessionManagerConfig {
            max_connections: 0,
            ..SessionManagerConfig::default()
        });
        let heartbeat =
            HeartbeatHandler::from_config(sessions.clone(), Arc::new(DefaultHostStatus), &config.websocket_server);
        GatewayDispatcher::from_config(&config, sessions, engine, heartbeat)
    }

    fn connect(d: &GatewayDispatcher) -> (Arc<GatewaySession>, Arc<RecordingConnection>) {
        let conn = RecordingConnection::new();
        let session = d.open_session(conn.clone()).unwrap();
        (session, conn)
    }

    fn auth_frame(token: &str) -> String {
        json!({"id": "a1", "type": "auth", "timestamp": null, "correlationId": null,
               "payload": {"gatewayId": "gw-1", "token": token}})
        .to_string()
    }

    fn request_frame() -> String {
        json!({"id": "req-9", "type": "request", "correlationId": null,
               "payload": {"capabilityId": "world.time.get", "parameters": {}}})
        .to_string()
    }

    #[tokio::test]
    async fn test_auth_success_sends_full_response() {
        let d = dispatcher();
        let (session, conn) = connect(&d);
        assert!(d.handle_text(&session, &auth_frame("ChangeMe!")).is_none());

        let frames = conn.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "auth_response");
        assert_eq!(frames[0]["correlationId"], "a1");
        let payload = &frames[0]["payload"];
        assert_eq!(payload["success"], true);
        assert_eq!(payload["gatewayId"], "gw-1");
        assert_eq!(payload["sessionId"], session.id());
        assert_eq!(payload["agentInfo"]["serverInfo"]["type"], "generic");
        assert_eq!(payload["permissions"].as_array().unwrap().len(), 3);
        assert_eq!(payload["capabilities"][0]["id"], "world.time.get");
        assert_eq!(payload["config"]["heartbeatInterval"], 30000);
        assert_eq!(d.sessions().get_session_by_gateway_id("gw-1").unwrap().id(), session.id());
        d.stop();
    }

    #[tokio::test]
    async fn test_auth_failure_closes_with_policy_violation() {
        let d = dispatcher();
        let (session, conn) = connect(&d);
        d.handle_text(&session, &auth_frame("wrong"));

        let frames = conn.frames();
        assert_eq!(frames[0]["payload"]["success"], false);
        assert_eq!(frames[0]["payload"]["reason"], "Invalid token");
        assert_eq!(conn.close_codes(), vec![CLOSE_AUTH_FAILED]);
        assert!(d.sessions().get_session(session.id()).is_none());
    }

    #[tokio::test]
    async fn test_reauth_is_ignored() {
        let d = dispatcher();
        let (session, conn) = connect(&d);
        d.handle_text(&session, &auth_frame("ChangeMe!"));
        d.handle_text(&session, &auth_frame("wrong"));
        assert_eq!(conn.frames().len(), 1);
        assert!(conn.close_codes().is_empty());
        d.stop();
    }

    #[tokio::test]
    async fn test_request_requires_authentication() {
        let d = dispatcher();
        let (session, conn) = connect(&d);
        assert!(d.handle_text(&session, &request_frame()).is_none());

        let frames = conn.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "response");
        assert_eq!(frames[0]["correlationId"], "req-9");
        assert_eq!(frames[0]["payload"]["success"], false);
        assert_eq!(frames[0]["payload"]["errorCode"], "AUTHENTICATION_FAILED");
        assert!(conn.close_codes().is_empty());
        d.stop();
    }

    #[tokio::test]
    async fn test_request_response_is_correlated() {
        let d = dispatcher();
        let (session, conn) = connect(&d);
        d.handle_text(&session, &auth_frame("ChangeMe!"));
        d.handle_text(&session, &request_frame()).unwrap().await.unwrap();

        let frames = conn.frames();
        let response: &Value = &frames[1];
        assert_eq!(response["type"], "response");
        assert_eq!(response["correlationId"], "req-9");
        assert_eq!(response["payload"]["success"], true);
        assert_eq!(response["payload"]["data"]["capability"], "world.time.get");
        d.stop();
    }

    #[tokio::test]
    async fn test_bad_frames_keep_connection() {
        let d = dispatcher();
        let (session, conn) = connect(&d);
        assert!(d.handle_text(&session, "not json").is_none());
        assert!(d
            .handle_text(&session, r#"{"id":"x","type":"mystery","payload":{}}"#)
            .is_none());
        assert!(conn.close_codes().is_empty());
        assert!(d.sessions().get_session(session.id()).is_some());
        d.stop();
    }

    #[tokio::test]
    async fn test_send_broadcast_and_stop() {
        let d = dispatcher();
        let (session, conn) = connect(&d);
        let (_idle, idle_conn) = connect(&d);
        d.handle_text(&session, &auth_frame("ChangeMe!"));

        let event = Message::new(Payload::Event(EventPayload {
            event_id: "player.join".into(),
            event_data: None,
        }));
        assert!(matches!(d.send("missing", &event), Err(SessionError::NotFound(_))));
        assert_eq!(d.broadcast(&event), 1);
        assert_eq!(conn.frames().last().unwrap()["type"], "event");
        assert!(idle_conn.frames().is_empty());

        d.stop();
        assert_eq!(conn.close_codes(), vec![CLOSE_GOING_AWAY]);
        assert_eq!(idle_conn.close_codes(), vec![CLOSE_GOING_AWAY]);
        assert_eq!(d.sessions().stats().total_sessions, 0);
    }
}
