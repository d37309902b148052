//! Role-based access: risk tiers → required roles, and per-gateway grants.
//!
//! Grants are keyed by gateway id with a `"default"` bucket used for any
//! gateway that has no entry of its own.

use std::collections::{HashMap, HashSet};

use crate::capabilities::RiskLevel;

/// Bucket consulted when a gateway has no explicit grant.
pub const DEFAULT_BUCKET: &str = "default";

pub const ROLE_OPERATOR: &str = "operator";
pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_SUPER_ADMIN: &str = "super_admin";

/// Role a caller must hold to invoke a capability of the given risk.
pub fn required_role(risk: RiskLevel) -> Option<&'static str> {
    match risk {
        RiskLevel::Low => None,
        RiskLevel::Medium => Some(ROLE_OPERATOR),
        RiskLevel::High => Some(ROLE_ADMIN),
        RiskLevel::Critical => Some(ROLE_SUPER_ADMIN),
    }
}

/// Grants keyed by gateway id, falling back to the default bucket.
#[derive(Debug, Clone, Default)]
pub struct GrantTable {
    grants: HashMap<String, HashSet<String>>,
}

impl GrantTable {
    pub fn new(grants: &HashMap<String, Vec<String>>) -> Self {
        Self {
            grants: grants
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
                .collect(),
        }
    }

    /// Grants for `gateway_id`, or the default bucket, or nothing.
    pub fn resolve(&self, gateway_id: &str) -> HashSet<String> {
        self.grants
            .get(gateway_id)
            .or_else(|| self.grants.get(DEFAULT_BUCKET))
            .cloned()
            .unwrap_or_default()
    }

    /// Add a grant to a gateway's bucket.
    pub fn grant(&mut self, gateway_id: &str, value: &str) {
        self.grants
            .entry(gateway_id.to_string())
            .or_default()
            .insert(value.to_string());
    }

    pub fn has_bucket(&self, gateway_id: &str) -> bool {
        self.grants.contains_key(gateway_id)
    }
}
