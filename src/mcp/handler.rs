//! MCP method handlers: `initialize`, `notifications/initialized`,
//! `tools/list` and `tools/call`.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::jsonrpc::{success_response, JsonRpcError, JsonRpcRequest};
use super::lifecycle::{McpSessionManager, SessionState};
use crate::capabilities::{CapabilityDescriptor, RiskLevel};
use crate::config::AgentConfig;
use crate::core::{CallerInfo, ExecutionEngine, ExecutionRequest};

pub const PROTOCOL_VERSION: &str = "2025-11-25";
pub const PAGE_SIZE: usize = 50;
pub const INSTRUCTIONS: &str = "MCP Agent ready. Use initialized notification to complete initialization.";
pub const SERVER_DESCRIPTION: &str = "MCP Agent - Provides host capabilities via MCP protocol";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// Identity reported in `serverInfo`.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub name: String,
    pub title: String,
    pub version: String,
}

impl ServerIdentity {
    fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "title": self.title,
            "version": self.version,
            "description": SERVER_DESCRIPTION,
        })
    }
}

/// Permissions and roles granted to every HTTP caller.
#[derive(Debug, Clone, Default)]
pub struct CallerGrant {
    pub permissions: Vec<String>,
    pub roles: Vec<String>,
}

pub struct McpHandler {
    sessions: Arc<McpSessionManager>,
    engine: Arc<ExecutionEngine>,
    identity: ServerIdentity,
    grant: CallerGrant,
}

impl McpHandler {
    pub fn new(
        sessions: Arc<McpSessionManager>,
        engine: Arc<ExecutionEngine>,
        identity: ServerIdentity,
        grant: CallerGrant,
    ) -> Self {
        Self {
            sessions,
            engine,
            identity,
            grant,
        }
    }

    pub fn from_config(config: &AgentConfig, sessions: Arc<McpSessionManager>, engine: Arc<ExecutionEngine>) -> Self {
        Self::new(
            sessions,
            engine,
            ServerIdentity {
                name: config.agent_info.agent_id.clone(),
                title: config.agent_info.agent_name.clone(),
                version: config.agent_info.agent_version.clone(),
            },
            CallerGrant {
                permissions: config.mcp_server.caller_permissions.clone(),
                roles: config.mcp_server.caller_roles.clone(),
            },
        )
    }

    pub fn sessions(&self) -> &Arc<McpSessionManager> {
        &self.sessions
    }

    /// Handle one message. Notifications yield `None`; requests always
    /// yield exactly one response.
    pub async fn handle(&self, request: JsonRpcRequest, session_id: &str) -> Option<Value> {
        self.sessions.update_activity(session_id);

        if request.is_notification() {
            match request.method.as_str() {
                METHOD_INITIALIZED => self.initialized(session_id),
                other => log::debug!("Ignoring notification {} for session {}", other, session_id),
            }
            return None;
        }

        let id = request.id.clone();
        let outcome = match request.method.as_str() {
            METHOD_INITIALIZE => self.initialize(&request, session_id),
            METHOD_TOOLS_LIST => self.tools_list(&request),
            METHOD_TOOLS_CALL => self.tools_call(&request, session_id).await,
            METHOD_INITIALIZED => {
                self.initialized(session_id);
                Ok(json!({}))
            }
            other => Err(JsonRpcError::method_not_found(other)),
        };

        Some(match outcome {
            Ok(result) => success_response(id, result),
            Err(error) => {
                log::debug!("{} failed for session {}: {}", request.method, session_id, error);
                error.to_response(id)
            }
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn initialize(&self, request: &JsonRpcRequest, session_id: &str) -> Result<Value, JsonRpcError> {
        let params = match &request.params {
            Some(Value::Object(map)) => map,
            _ => return Err(JsonRpcError::invalid_params("Invalid params: params must be an object")),
        };
        let requested = required(params, "protocolVersion")?;
        let client_capabilities = required(params, "capabilities")?.clone();
        let client_info = required(params, "clientInfo")?.clone();

        let requested = requested.as_str().unwrap_or_default().to_string();
        if requested != PROTOCOL_VERSION {
            return Err(JsonRpcError::with_data(
                super::jsonrpc::JsonRpcErrorCode::InvalidParams,
                "Unsupported protocol version",
                json!({"supported": [PROTOCOL_VERSION], "requested": requested}),
            ));
        }

        let capabilities = server_capabilities();
        let server_info = self.identity.to_value();
        self.sessions.with_session(session_id, |session| {
            if session.state != SessionState::Initializing {
                log::warn!(
                    "Rejecting initialize for session {} in state {}",
                    session_id,
                    session.state
                );
                return Err(JsonRpcError::new(
                    super::jsonrpc::JsonRpcErrorCode::InvalidRequest,
                    format!("Session already initialized (state: {})", session.state),
                ));
            }
            session.protocol_version = Some(requested.clone());
            session.client_capabilities = Some(client_capabilities);
            session.client_info = Some(client_info);
            session.server_capabilities = Some(capabilities.clone());
            session.server_info = Some(server_info.clone());
            session.instructions = Some(INSTRUCTIONS.to_string());
            session.advance(SessionState::Initialized);
            log::info!(
                "MCP session initialized: {}, client: {}, protocol: {}",
                session_id,
                session.client_name(),
                requested
            );
            Ok(())
        })?;

        Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": capabilities,
            "serverInfo": server_info,
            "instructions": INSTRUCTIONS,
        }))
    }

    fn initialized(&self, session_id: &str) {
        let outcome = self.sessions.update_session(session_id, |session| {
            if session.state != SessionState::Initialized {
                log::warn!(
                    "Received initialized notification for session in wrong state: {}, state: {}",
                    session_id,
                    session.state
                );
                return;
            }
            session.advance(SessionState::Operating);
            log::info!(
                "MCP session ready for operation: {}, client: {}",
                session_id,
                session.client_name()
            );
        });
        if outcome.is_none() {
            log::warn!("Received initialized notification for unknown session: {}", session_id);
        }
    }

    // -----------------------------------------------------------------------
    // Tools
    // -----------------------------------------------------------------------

    fn tools_list(&self, request: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let params = request.params_object()?;
        let tools: Vec<Arc<CapabilityDescriptor>> = self
            .engine
            .registry()
            .descriptors()
            .into_iter()
            .filter(|c| c.capability_type.is_tool())
            .collect();

        let (page, start) = match params.get("cursor").filter(|c| !c.is_null()) {
            None => (page_of(&tools, 0), 0),
            Some(cursor) => match parse_cursor(cursor) {
                Some(start) => (page_of(&tools, start), start),
                // Unreadable cursors get the whole list.
                None => (tools.as_slice(), 0),
            },
        };

        let mut result = json!({
            "tools": page.iter().map(|c| tool_json(c)).collect::<Vec<_>>(),
        });
        // A full page always advertises a next cursor, even if it turns out
        // to be empty.
        if page.len() >= PAGE_SIZE {
            result["nextCursor"] = Value::String((start + page.len()).to_string());
        }
        Ok(result)
    }

    async fn tools_call(&self, request: &JsonRpcRequest, session_id: &str) -> Result<Value, JsonRpcError> {
        let params = request.params_object()?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| JsonRpcError::invalid_params("Invalid params: 'name' is required"))?;
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(JsonRpcError::invalid_params("Invalid params: 'arguments' must be an object")),
        };

        let descriptor = self
            .engine
            .registry()
            .get_capability_descriptor(name)
            .filter(|c| c.capability_type.is_tool())
            .ok_or_else(|| JsonRpcError::invalid_params(format!("Unknown tool: {}", name)))?;

        if !self.sessions.is_session_ready(session_id) {
            log::debug!("tools/call on session {} before initialization completed", session_id);
        }

        let request_id = match &request.id {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let caller = CallerInfo::new(
            format!("mcp:{}", session_id),
            self.grant.permissions.iter().cloned(),
            self.grant.roles.iter().cloned(),
        );
        let response = self
            .engine
            .execute(ExecutionRequest::new(request_id, &descriptor.id, arguments), Some(caller))
            .await;

        if !response.success {
            let message = response.error_message.unwrap_or_else(|| "Unknown error".to_string());
            return Ok(tool_error(&format!("Tool execution failed: {}", message)));
        }
        Ok(tool_success(response.data.unwrap_or(Value::Null)))
    }
}

impl std::fmt::Debug for McpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpHandler")
            .field("identity", &self.identity)
            .field("sessions", &self.sessions)
            .finish()
    }
}

fn required<'a>(params: &'a Map<String, Value>, field: &str) -> Result<&'a Value, JsonRpcError> {
    params
        .get(field)
        .filter(|v| !v.is_null())
        .ok_or_else(|| JsonRpcError::invalid_params(format!("Invalid params: {} is required", field)))
}

fn server_capabilities() -> Value {
    json!({
        "tools": {"listChanged": true},
        "resources": {"subscribe": true, "listChanged": true},
        "prompts": {"listChanged": true},
        "logging": {},
        "tasks": {"requests": {"tools": {}}},
    })
}

fn parse_cursor(cursor: &Value) -> Option<usize> {
    match cursor {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        _ => None,
    }
}

fn page_of<T>(items: &[T], start: usize) -> &[T] {
    if start >= items.len() {
        return &[];
    }
    &items[start..(start + PAGE_SIZE).min(items.len())]
}

fn tool_json(capability: &CapabilityDescriptor) -> Value {
    let input_schema = if capability.parameter_schema.is_object() {
        capability.parameter_schema.clone()
    } else {
        json!({"type": "object", "properties": {}})
    };
    json!({
        "name": capability.id,
        "title": capability.name,
        "description": capability.description,
        "inputSchema": input_schema,
        "annotations": {
            "readOnlyHint": !matches!(capability.capability_type, crate::capabilities::CapabilityType::Action),
            "destructiveHint": capability.risk_level >= RiskLevel::High,
        },
    })
}

fn tool_success(data: Value) -> Value {
    let text = match &data {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut result = json!({
        "content": [{"type": "text", "text": text}],
        "isError": false,
    });
    if data.is_object() {
        result["structuredContent"] = data;
    }
    result
}

fn tool_error(message: &str) -> Value {
    json!({
        "content": [{"type": "text", "text": message}],
        "isError": true,
    })
}
