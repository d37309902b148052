//! Error taxonomy shared by the execution pipeline and both transports.
//!
//! Capability-level failures carry an [`ErrorCode`] that is serialized into
//! gateway `response` frames as a SCREAMING_SNAKE string. Transport-specific
//! errors (codec, JSON-RPC) live next to their transports and convert into
//! this taxonomy where they cross the boundary.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes exposed to gateways in `response` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A required parameter was absent.
    ParameterRequired,
    /// A parameter had the wrong type or failed a constraint.
    ParameterInvalid,
    /// A value failed schema validation.
    SchemaValidationFailed,
    /// The caller lacks a permission or role.
    PermissionDenied,
    /// No capability is registered under the requested id.
    CapabilityNotFound,
    /// A string did not name any variant of the target enum.
    InvalidEnumValue,
    /// The capability itself reported a failure.
    OperationFailed,
    /// Unexpected failure; details are only logged.
    InternalError,
    /// A wire frame could not be decoded.
    DecodeError,
    /// Gateway credentials were rejected.
    AuthenticationFailed,
}

impl ErrorCode {
    /// Wire name of the code, e.g. `"CAPABILITY_NOT_FOUND"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParameterRequired => "PARAMETER_REQUIRED",
            Self::ParameterInvalid => "PARAMETER_INVALID",
            Self::SchemaValidationFailed => "SCHEMA_VALIDATION_FAILED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::CapabilityNotFound => "CAPABILITY_NOT_FOUND",
            Self::InvalidEnumValue => "INVALID_ENUM_VALUE",
            Self::OperationFailed => "OPERATION_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::DecodeError => "DECODE_ERROR",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
        }
    }

    /// Parse a wire name back into a code.
    ///
    /// Unknown names return `None`; callers fall back to `OperationFailed`.
    pub fn from_name(name: &str) -> Option<Self> {
        let code = match name {
            "PARAMETER_REQUIRED" => Self::ParameterRequired,
            "PARAMETER_INVALID" => Self::ParameterInvalid,
            "SCHEMA_VALIDATION_FAILED" => Self::SchemaValidationFailed,
            "PERMISSION_DENIED" => Self::PermissionDenied,
            "CAPABILITY_NOT_FOUND" => Self::CapabilityNotFound,
            "INVALID_ENUM_VALUE" => Self::InvalidEnumValue,
            "OPERATION_FAILED" => Self::OperationFailed,
            "INTERNAL_ERROR" => Self::InternalError,
            "DECODE_ERROR" => Self::DecodeError,
            "AUTHENTICATION_FAILED" => Self::AuthenticationFailed,
            _ => return None,
        };
        Some(code)
    }

    /// True for the validation family (required / invalid / schema).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::ParameterRequired | Self::ParameterInvalid | Self::SchemaValidationFailed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised anywhere inside a capability invocation.
///
/// `Business` errors surface to the caller with their code and message.
/// `Internal` errors are logged in full and reduced to a generic message.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// A classified failure whose message is safe to return to the caller.
    #[error("{message}")]
    Business { code: ErrorCode, message: String },

    /// A capability failed without a classified code.
    #[error("Capability failed: {0}")]
    Failed(String),

    /// Anything unexpected. The message never leaves the process.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CapabilityError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Business {
            code,
            message: message.into(),
        }
    }

    /// Build a business error from a wire code name, falling back to
    /// `OPERATION_FAILED` when the name is not part of the taxonomy.
    pub fn from_code_name(name: &str, message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::from_name(name).unwrap_or(ErrorCode::OperationFailed),
            message,
        )
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParameterInvalid, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// The code this error maps to, if it carries one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Business { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_names_roundtrip_through_serde() {
        let json = serde_json::to_string(&ErrorCode::CapabilityNotFound).unwrap();
        assert_eq!(json, "\"CAPABILITY_NOT_FOUND\"");
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::CapabilityNotFound);
        assert_eq!(ErrorCode::CapabilityNotFound.as_str(), "CAPABILITY_NOT_FOUND");
    }

    #[test]
    fn test_unknown_code_name_falls_back_to_operation_failed() {
        let err = CapabilityError::from_code_name("NOT_A_CODE", "boom");
        assert_eq!(err.code(), Some(ErrorCode::OperationFailed));
        assert_eq!(err.to_string(), "boom");

        let err = CapabilityError::from_code_name("PERMISSION_DENIED", "nope");
        assert_eq!(err.code(), Some(ErrorCode::PermissionDenied));
    }

    #[test]
    fn test_validation_family() {
        assert!(ErrorCode::ParameterRequired.is_validation());
        assert!(ErrorCode::SchemaValidationFailed.is_validation());
        assert!(!ErrorCode::PermissionDenied.is_validation());
    }
}
