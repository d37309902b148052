//! Gateway credential check and permission grants.

use std::collections::HashSet;

use crate::config::AgentConfig;
use crate::policy::GrantTable;

/// Outcome of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Success {
        permissions: HashSet<String>,
        roles: HashSet<String>,
    },
    Failure {
        reason: String,
    },
}

impl AuthResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Compares gateway tokens against the configured secret.
///
/// An empty secret puts the handler in open mode, where every token is
/// accepted. Open mode is for development only and is logged at warn level
/// on every attempt.
#[derive(Debug, Clone)]
pub struct AuthHandler {
    auth_token: String,
    permissions: GrantTable,
    roles: GrantTable,
}

impl AuthHandler {
    pub fn new(auth_token: impl Into<String>, permissions: GrantTable, roles: GrantTable) -> Self {
        let handler = Self {
            auth_token: auth_token.into(),
            permissions,
            roles,
        };
        if handler.is_open() {
            log::warn!("Gateway auth token is not configured: ALL gateway connections will be accepted");
        }
        handler
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.websocket_server.auth_token.clone(),
            GrantTable::new(&config.gateway_permissions),
            GrantTable::new(&config.gateway_roles),
        )
    }

    pub fn is_open(&self) -> bool {
        self.auth_token.trim().is_empty()
    }

    pub fn authenticate(&self, gateway_id: &str, token: &str) -> AuthResult {
        if self.is_open() {
            log::warn!(
                "Accepting gateway {} without token check (open authentication, development only)",
                gateway_id
            );
        } else if !constant_time_eq(self.auth_token.as_bytes(), token.as_bytes()) {
            log::warn!("Authentication failed for gateway {}: Invalid token", gateway_id);
            return AuthResult::Failure {
                reason: "Invalid token".to_string(),
            };
        }

        let permissions = self.permissions.resolve(gateway_id);
        let roles = self.roles.resolve(gateway_id);
        log::debug!(
            "Gateway {} granted {} permissions and roles {:?}",
            gateway_id,
            permissions.len(),
            roles
        );
        AuthResult::Success { permissions, roles }
    }

    /// Roles configured for a gateway, without a token check.
    pub fn roles_for(&self, gateway_id: &str) -> HashSet<String> {
        self.roles.resolve(gateway_id)
    }
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
