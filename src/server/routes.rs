//! Axum routes for the MCP HTTP transport and the gateway WebSocket endpoint.
//!
//! # Routes
//!
//! - `GET  /health`       Returns `{"status": "ok", "version": ...}`
//! - `POST {mcp path}`    One JSON-RPC message per request
//! - `GET  {mcp path}`    SSE stream with keep-alive
//! - `GET  {ws path}`     Gateway WebSocket upgrade
//!
//! The MCP path answers any other method with 405.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::ws;
use crate::capabilities::CapabilityRegistry;
use crate::gateway::auth::constant_time_eq;
use crate::gateway::GatewayDispatcher;
use crate::mcp::jsonrpc::{JsonRpcError, JsonRpcErrorCode, JsonRpcRequest};
use crate::mcp::McpHandler;

pub const SESSION_HEADER: &str = "x-session-id";
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Shared application state for both HTTP listeners.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CapabilityRegistry>,
    pub mcp: Arc<McpHandler>,
    pub gateway: Arc<GatewayDispatcher>,
    pub bearer_token: Arc<str>,
    pub mcp_path: Arc<str>,
    pub ws_path: Arc<str>,
}

/// Router for the MCP JSON-RPC transport.
pub fn app_router(state: AppState) -> Router {
    let path = state.mcp_path.to_string();
    Router::new()
        .route("/health", get(health_handler))
        .route(&path, get(sse_handler).post(mcp_post_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Router for the gateway WebSocket endpoint.
pub fn gateway_router(state: AppState) -> Router {
    let path = state.ws_path.to_string();
    Router::new()
        .route("/health", get(health_handler))
        .route(&path, get(ws_upgrade_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health: liveness probe with session and capability counts.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "mcp-agent",
        "capabilities": state.registry.capability_count(),
        "gateways": state.gateway.sessions().stats(),
        "mcpSessions": state.mcp.sessions().session_count(),
    }))
}

async fn ws_upgrade_handler(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    let dispatcher = state.gateway.clone();
    upgrade.on_upgrade(move |socket| ws::serve_socket(socket, dispatcher))
}

// ---------------------------------------------------------------------------
// MCP transport
// ---------------------------------------------------------------------------

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    if state.bearer_token.trim().is_empty() {
        log::warn!("MCP bearer token is not configured, accepting request without authentication");
        return true;
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| constant_time_eq(token.trim().as_bytes(), state.bearer_token.as_bytes()))
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Unauthorized"})),
    )
        .into_response()
}

fn rpc_error(status: StatusCode, error: JsonRpcError, id: Option<Value>) -> Response {
    (status, Json(error.to_response(id))).into_response()
}

/// Session id from the header, or one derived from the request.
fn session_id(headers: &HeaderMap, request: &JsonRpcRequest) -> String {
    if let Some(id) = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
    {
        return id.to_string();
    }
    match &request.id {
        Some(Value::String(id)) => format!("session-{}", id),
        Some(id) => format!("session-{}", id),
        None => format!("session-notification-{}", chrono::Utc::now().timestamp_millis()),
    }
}

/// POST {mcp path}: one JSON-RPC request or notification.
async fn mcp_post_handler(State(state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    if let Some(version) = headers.get(PROTOCOL_VERSION_HEADER).and_then(|v| v.to_str().ok()) {
        log::debug!("MCP-Protocol-Version: {}", version);
    }
    if body.trim().is_empty() {
        return rpc_error(
            StatusCode::BAD_REQUEST,
            JsonRpcError::new(JsonRpcErrorCode::InvalidRequest, "Empty request body"),
            None,
        );
    }

    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            log::debug!("Unparsable MCP request: {}", e);
            return rpc_error(
                StatusCode::BAD_REQUEST,
                JsonRpcError::from_code(JsonRpcErrorCode::ParseError),
                None,
            );
        }
    };
    let raw_id = value.get("id").cloned();
    let request = match JsonRpcRequest::from_value(value) {
        Ok(request) => request,
        Err(error) => return rpc_error(StatusCode::BAD_REQUEST, error, raw_id),
    };

    let session = session_id(&headers, &request);
    log::debug!("MCP {} on session {}", request.method, session);
    match state.mcp.handle(request, &session).await {
        None => StatusCode::ACCEPTED.into_response(),
        Some(reply) => {
            let mut response = Json(reply).into_response();
            if let Ok(value) = HeaderValue::from_str(&session) {
                response.headers_mut().insert(SESSION_HEADER, value);
            }
            response
        }
    }
}

/// GET {mcp path}: server-to-client event stream. Only an `endpoint` event is
/// emitted; the stream stays open with keep-alive comments.
async fn sse_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    Sse::new(endpoint_stream(state.mcp_path.to_string()))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn endpoint_stream(path: String) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::once(async move { Ok(Event::default().event("endpoint").data(path)) }).chain(stream::pending())
}
