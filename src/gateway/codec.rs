//! JSON codec for the gateway envelope.
//!
//! Decoding happens in two steps: the envelope is read into a loose frame,
//! then the `type` string selects the payload struct. A bad frame fails only
//! that frame; callers log the error and keep the connection.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::message::*;
use crate::core::context::{ExecutionRequest, ExecutionResponse};
use crate::error::ErrorCode;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid JSON format: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {message_type} payload: {source}")]
    Payload {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CodecError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::DecodeError
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Frame {
    id: String,
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Stateless encoder/decoder for gateway frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }

    /// Serialize a message with a fresh timestamp. `correlationId` is always
    /// present, as `null` when unset.
    pub fn encode(&self, message: &Message) -> Result<String, CodecError> {
        let payload = match &message.payload {
            Payload::Request(p) => serde_json::to_value(p)?,
            Payload::Response(p) => serde_json::to_value(p)?,
            Payload::Event(p) => serde_json::to_value(p)?,
            Payload::Heartbeat(p) => serde_json::to_value(p)?,
            Payload::HeartbeatAck(p) => serde_json::to_value(p)?,
            Payload::Auth(p) => serde_json::to_value(p)?,
            Payload::AuthResponse(p) => serde_json::to_value(p)?,
        };
        let frame = Frame {
            id: message.id.clone(),
            message_type: message.message_type().to_string(),
            timestamp: Some(Utc::now()),
            correlation_id: message.correlation_id.clone(),
            payload,
        };
        Ok(serde_json::to_string(&frame)?)
    }

    pub fn decode(&self, text: &str) -> Result<Message, CodecError> {
        let frame: Frame = serde_json::from_str(text)?;
        let Frame {
            id,
            message_type,
            timestamp,
            correlation_id,
            payload,
        } = frame;

        let payload = match message_type.as_str() {
            TYPE_REQUEST => {
                let mut request: ExecutionRequest = typed(&message_type, payload)?;
                request.id = id.clone();
                Payload::Request(request)
            }
            TYPE_RESPONSE => {
                let mut response: ExecutionResponse = typed(&message_type, payload)?;
                response.request_id = correlation_id.clone().unwrap_or_default();
                Payload::Response(response)
            }
            TYPE_EVENT => Payload::Event(typed(&message_type, payload)?),
            TYPE_HEARTBEAT => Payload::Heartbeat(typed(&message_type, payload)?),
            TYPE_HEARTBEAT_ACK => Payload::HeartbeatAck(typed(&message_type, payload)?),
            TYPE_AUTH => Payload::Auth(typed(&message_type, payload)?),
            TYPE_AUTH_RESPONSE => Payload::AuthResponse(typed(&message_type, payload)?),
            other => return Err(CodecError::UnknownType(other.to_string())),
        };

        Ok(Message {
            id,
            timestamp: timestamp.unwrap_or_else(Utc::now),
            correlation_id,
            payload,
        })
    }
}

fn typed<T: DeserializeOwned>(message_type: &str, payload: Value) -> Result<T, CodecError> {
    serde_json::from_value(payload).map_err(|source| CodecError::Payload {
        message_type: message_type.to_string(),
        source,
    })
}
