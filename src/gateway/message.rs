//! Gateway wire messages.
//!
//! Every frame is an envelope
//! `{id, type, timestamp, correlationId, payload}`; the `type` string selects
//! the payload shape. Payload field names are camelCase on the wire.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capabilities::CapabilityManifest;
use crate::core::context::{ExecutionRequest, ExecutionResponse};

pub const TYPE_REQUEST: &str = "request";
pub const TYPE_RESPONSE: &str = "response";
pub const TYPE_EVENT: &str = "event";
pub const TYPE_HEARTBEAT: &str = "heartbeat";
pub const TYPE_HEARTBEAT_ACK: &str = "heartbeat_ack";
pub const TYPE_AUTH: &str = "auth";
pub const TYPE_AUTH_RESPONSE: &str = "auth_response";

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Event emitted towards gateways.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub event_id: String,
    #[serde(default)]
    pub event_data: Option<Value>,
}

/// Host snapshot carried by heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    pub healthy: bool,
    /// Tick or load rate of the host.
    pub tps: f64,
    #[serde(alias = "onlinePlayers")]
    pub online_units: u32,
    /// Memory pressure as a percentage.
    pub memory_usage: f64,
    pub connected_gateways: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub gateway_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: Option<HostStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAckPayload {
    pub gateway_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub gateway_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: String,
    pub version: String,
    pub max_players: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfoPayload {
    pub id: String,
    pub name: String,
    pub version: String,
    pub environment: String,
    pub server_info: HostInfo,
}

/// Connection parameters the gateway should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub heartbeat_interval: u64,
    pub reconnect_delay: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponsePayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_info: Option<AgentInfoPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub permissions: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<CapabilityManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ClientConfig>,
}

impl AuthResponsePayload {
    pub fn failure(gateway_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            gateway_id: Some(gateway_id.into()),
            session_id: None,
            agent_info: None,
            reason: Some(reason.into()),
            permissions: BTreeSet::new(),
            capabilities: Vec::new(),
            config: None,
        }
    }
}

/// Typed payload; the variant determines the envelope `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Request(ExecutionRequest),
    Response(ExecutionResponse),
    Event(EventPayload),
    Heartbeat(HeartbeatPayload),
    HeartbeatAck(HeartbeatAckPayload),
    Auth(AuthPayload),
    AuthResponse(AuthResponsePayload),
}

impl Payload {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Request(_) => TYPE_REQUEST,
            Self::Response(_) => TYPE_RESPONSE,
            Self::Event(_) => TYPE_EVENT,
            Self::Heartbeat(_) => TYPE_HEARTBEAT,
            Self::HeartbeatAck(_) => TYPE_HEARTBEAT_ACK,
            Self::Auth(_) => TYPE_AUTH,
            Self::AuthResponse(_) => TYPE_AUTH_RESPONSE,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One decoded gateway frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub payload: Payload,
}

impl Message {
    /// New message with a random id.
    pub fn new(payload: Payload) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), payload)
    }

    pub fn with_id(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            correlation_id: None,
            payload,
        }
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn message_type(&self) -> &'static str {
        self.payload.message_type()
    }

    /// `response` frame answering the request with id `response.request_id`.
    pub fn response(response: ExecutionResponse) -> Self {
        let correlation = response.request_id.clone();
        Self::new(Payload::Response(response)).correlated(correlation)
    }
}
