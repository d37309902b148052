//! Per-invocation records: the request, the caller, the mutable context the
//! interceptors see, and the response envelope returned to transports.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capabilities::CapabilityDescriptor;
use crate::error::ErrorCode;

// ---------------------------------------------------------------------------
// Caller
// ---------------------------------------------------------------------------

/// Identity of whoever is invoking a capability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerInfo {
    pub id: String,
    pub permissions: HashSet<String>,
    pub roles: HashSet<String>,
}

impl CallerInfo {
    pub fn new<P, R>(id: impl Into<String>, permissions: P, roles: R) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            id: id.into(),
            permissions: permissions.into_iter().map(Into::into).collect(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn has_all_permissions<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> bool {
        required.into_iter().all(|p| self.permissions.contains(p))
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// A request to run one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    #[serde(skip)]
    pub id: String,
    pub capability_id: String,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ExecutionRequest {
    pub fn new(id: impl Into<String>, capability_id: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            capability_id: capability_id.into(),
            caller_id: None,
            parameters,
        }
    }
}

/// Outcome of one invocation.
///
/// Serializes as the gateway `response` payload:
/// `{success, errorCode?, errorMessage?, data?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    #[serde(skip)]
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ExecutionResponse {
    pub fn success(request_id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            error_code: None,
            error_message: None,
            data,
        }
    }

    pub fn error(request_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            error_code: Some(code),
            error_message: Some(message.into()),
            data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Mutable state threaded through the interceptor chain for one invocation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request_id: String,
    pub capability: Arc<CapabilityDescriptor>,
    pub caller: Option<CallerInfo>,
    pub parameters: Map<String, Value>,
    pub result: Option<Value>,
    pub skipped: bool,
    /// When set by an interceptor, returned instead of the default envelope.
    pub response: Option<ExecutionResponse>,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(
        request: &ExecutionRequest,
        capability: Arc<CapabilityDescriptor>,
        caller: Option<CallerInfo>,
    ) -> Self {
        Self {
            request_id: request.id.clone(),
            capability,
            caller,
            parameters: request.parameters.clone(),
            result: None,
            skipped: false,
            response: None,
            started_at: Utc::now(),
        }
    }

    pub fn capability_id(&self) -> &str {
        &self.capability.id
    }

    pub fn caller_id(&self) -> &str {
        self.caller.as_ref().map(|c| c.id.as_str()).unwrap_or("unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_caller_permission_checks() {
        let caller = CallerInfo::new("gw-1", ["a", "b"], ["operator"]);
        let required = vec!["a".to_string(), "b".to_string()];
        assert!(caller.has_all_permissions(&required));
        assert!(!caller.has_all_permissions(&vec!["c".to_string()]));
        assert!(caller.has_all_permissions(&Vec::<String>::new()));
        assert!(caller.has_role("operator"));
        assert!(!caller.has_role("admin"));
    }

    #[test]
    fn test_response_payload_shape() {
        let ok = ExecutionResponse::success("r1", Some(json!({"time": 6000})));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"success": true, "data": {"time": 6000}})
        );

        let err = ExecutionResponse::error("r2", ErrorCode::CapabilityNotFound, "Capability not found: x");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({
                "success": false,
                "errorCode": "CAPABILITY_NOT_FOUND",
                "errorMessage": "Capability not found: x"
            })
        );
    }

    #[test]
    fn test_request_payload_parses() {
        let req: ExecutionRequest = serde_json::from_value(json!({
            "capabilityId": "world.time.get",
            "parameters": {"world": "overworld"}
        }))
        .unwrap();
        assert_eq!(req.capability_id, "world.time.get");
        assert_eq!(req.caller_id, None);
        assert_eq!(req.parameters["world"], "overworld");
    }
}
