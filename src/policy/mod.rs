//! # Policy
//!
//! Authorization for capability invocations. [`PermissionChecker`] is the
//! first interceptor in the default chain: it requires a caller, checks that
//! the caller holds every permission the capability declares, and then
//! checks the role its risk tier demands.
//!
//! ```text
//! Low      → no role
//! Medium   → operator
//! High     → admin
//! Critical → super_admin
//! ```
//!
//! The checker is a pure gate. Rejection is its only effect.

pub mod rbac;

use crate::core::chain::Interceptor;
use crate::core::context::ExecutionContext;
use crate::error::CapabilityError;

pub use rbac::{required_role, GrantTable, DEFAULT_BUCKET};

/// Default interceptor order: before schema validation and audit.
pub const PERMISSION_ORDER: i32 = 100;

/// Interceptor rejecting callers without the required permissions or role.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissionChecker;

impl PermissionChecker {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate `ctx` without running the chain.
    pub fn check(&self, ctx: &ExecutionContext) -> Result<(), CapabilityError> {
        let capability = &ctx.capability;
        if capability.id.is_empty() {
            return Err(CapabilityError::permission_denied("No capability specified"));
        }
        let Some(caller) = ctx.caller.as_ref() else {
            return Err(CapabilityError::permission_denied(
                "No caller information available",
            ));
        };

        if !caller.has_all_permissions(&capability.permissions) {
            log::warn!(
                "Caller {} lacks permissions {:?} for {}",
                caller.id,
                capability.permissions,
                capability.id
            );
            return Err(CapabilityError::permission_denied(format!(
                "Insufficient permissions to execute capability: {}",
                capability.id
            )));
        }

        if let Some(role) = required_role(capability.risk_level) {
            if !caller.has_role(role) {
                log::warn!(
                    "Caller {} lacks role {} for {} (risk {})",
                    caller.id,
                    role,
                    capability.id,
                    capability.risk_level.as_str()
                );
                return Err(CapabilityError::permission_denied(format!(
                    "Insufficient role to execute capability: {}. Required role: {}",
                    capability.id, role
                )));
            }
        }

        Ok(())
    }
}

impl Interceptor for PermissionChecker {
    fn name(&self) -> &str {
        "permission"
    }

    fn order(&self) -> i32 {
        PERMISSION_ORDER
    }

    fn pre_handle(&self, ctx: &mut ExecutionContext) -> Result<bool, CapabilityError> {
        self.check(ctx)?;
        log::debug!("Permission check passed for {} by {}", ctx.capability_id(), ctx.caller_id());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::capability::{handler_fn, CapabilityBinding, CapabilitySpec};
    use crate::capabilities::{CapabilityDescriptor, RiskLevel};
    use crate::core::context::{CallerInfo, ExecutionRequest};
    use crate::error::ErrorCode;
    use serde_json::Value;
    use std::sync::Arc;

    fn ctx(spec: CapabilitySpec, caller: Option<CallerInfo>) -> ExecutionContext {
        let desc = CapabilityDescriptor::from_binding(
            CapabilityBinding::new(spec, handler_fn(|_| async { Ok(Value::Null) })),
            "p",
        );
        ExecutionContext::new(
            &ExecutionRequest::new("r", desc.id.clone(), Default::default()),
            Arc::new(desc),
            caller,
        )
    }

    #[test]
    fn test_missing_caller_denied() {
        let mut c = ctx(CapabilitySpec::context("world.time.get", "t"), None);
        let err = PermissionChecker.pre_handle(&mut c).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::PermissionDenied));
        assert_eq!(err.to_string(), "No caller information available");
    }

    #[test]
    fn test_all_permissions_required() {
        let spec = CapabilitySpec::context("world.time.get", "t")
            .with_permission("world.read")
            .with_permission("time.read");
        let caller = CallerInfo::new("gw", ["world.read"], Vec::<String>::new());
        let mut c = ctx(spec.clone(), Some(caller));
        let err = PermissionChecker.pre_handle(&mut c).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Insufficient permissions to execute capability: world.time.get"
        );

        let caller = CallerInfo::new("gw", ["world.read", "time.read"], Vec::<String>::new());
        let mut c = ctx(spec, Some(caller));
        assert!(PermissionChecker.pre_handle(&mut c).unwrap());
    }

    #[test]
    fn test_risk_tier_requires_role() {
        let spec = CapabilitySpec::action("world.time.set", "t").with_risk(RiskLevel::High);
        let operator = CallerInfo::new("gw", Vec::<String>::new(), ["operator"]);
        let mut c = ctx(spec.clone(), Some(operator));
        let err = PermissionChecker.pre_handle(&mut c).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Insufficient role to execute capability: world.time.set. Required role: admin"
        );

        let admin = CallerInfo::new("gw", Vec::<String>::new(), ["admin"]);
        let mut c = ctx(spec, Some(admin));
        assert!(PermissionChecker.pre_handle(&mut c).unwrap());
    }

    #[test]
    fn test_low_risk_needs_no_role() {
        let caller = CallerInfo::new("gw", Vec::<String>::new(), Vec::<String>::new());
        let mut c = ctx(CapabilitySpec::action("a.b", "t"), Some(caller));
        assert!(PermissionChecker.pre_handle(&mut c).unwrap());
    }
}
