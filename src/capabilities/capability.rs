//! Capability definition: the unit of host functionality exposed to gateways.
//!
//! A provider hands the registry a list of [`CapabilityBinding`]s, each a
//! declarative [`CapabilitySpec`] paired with the callable that implements
//! it. The registry turns them into immutable [`CapabilityDescriptor`]s.
//! Gateways only ever see the [`CapabilityManifest`] projection.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::binding::{schema_from_bindings, BoundArgs, ParamBinding};
use crate::error::CapabilityError;

/// Default cache TTL (seconds) for Context capabilities.
pub const DEFAULT_CONTEXT_CACHE_TTL: u64 = 60;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// What kind of operation a capability performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CapabilityType {
    /// Read-only query.
    Context,
    /// Mutating operation.
    Action,
    /// Notification source.
    Event,
}

impl CapabilityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Context => "CONTEXT",
            Self::Action => "ACTION",
            Self::Event => "EVENT",
        }
    }

    /// Context and Action capabilities are exposed as MCP tools.
    pub fn is_tool(&self) -> bool {
        matches!(self, Self::Context | Self::Action)
    }
}

/// Coarse authorization tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::Low
    }
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

// ---------------------------------------------------------------------------
// Callable
// ---------------------------------------------------------------------------

/// The callable behind a capability.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn invoke(&self, args: BoundArgs) -> Result<Value, CapabilityError>;
}

/// Adapter so plain async closures can serve as handlers.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CapabilityHandler for FnHandler<F>
where
    F: Fn(BoundArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send + 'static,
{
    async fn invoke(&self, args: BoundArgs) -> Result<Value, CapabilityError> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as a shareable [`CapabilityHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CapabilityHandler>
where
    F: Fn(BoundArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ---------------------------------------------------------------------------
// Declaration
// ---------------------------------------------------------------------------

/// Declarative description of one capability, as written by a provider.
///
/// ```ignore
/// let spec = CapabilitySpec::context("world.time.get", "Get world time")
///     .with_permission("mcp.context.world.time")
///     .with_param(ParamBinding::new("world", ParamKind::String).required());
/// ```
#[derive(Debug, Clone)]
pub struct CapabilitySpec {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub capability_type: CapabilityType,
    pub permissions: Vec<String>,
    pub tags: Vec<String>,
    pub risk_level: RiskLevel,
    pub rollback_supported: bool,
    pub snapshot_required: bool,
    pub confirm_required: bool,
    /// Overrides the type default when set.
    pub cacheable: Option<bool>,
    pub cache_ttl: Option<u64>,
    pub params: Vec<ParamBinding>,
    /// Explicit parameter schema; derived from `params` when absent.
    pub parameter_schema: Option<Value>,
    pub return_schema: Option<Value>,
}

impl CapabilitySpec {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        capability_type: CapabilityType,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: description.into(),
            version: "1.0.0".to_string(),
            capability_type,
            permissions: Vec::new(),
            tags: Vec::new(),
            risk_level: RiskLevel::Low,
            rollback_supported: false,
            snapshot_required: false,
            confirm_required: false,
            cacheable: None,
            cache_ttl: None,
            params: Vec::new(),
            parameter_schema: None,
            return_schema: None,
        }
    }

    pub fn context(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(id, description, CapabilityType::Context)
    }

    pub fn action(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(id, description, CapabilityType::Action)
    }

    pub fn event(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(id, description, CapabilityType::Event)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk_level = risk;
        self
    }

    pub fn with_rollback(mut self) -> Self {
        self.rollback_supported = true;
        self
    }

    pub fn with_snapshot(mut self) -> Self {
        self.snapshot_required = true;
        self
    }

    pub fn with_confirm(mut self) -> Self {
        self.confirm_required = true;
        self
    }

    pub fn with_cache(mut self, cacheable: bool, ttl_secs: u64) -> Self {
        self.cacheable = Some(cacheable);
        self.cache_ttl = Some(ttl_secs);
        self
    }

    pub fn with_param(mut self, param: ParamBinding) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_parameter_schema(mut self, schema: Value) -> Self {
        self.parameter_schema = Some(schema);
        self
    }

    pub fn with_return_schema(mut self, schema: Value) -> Self {
        self.return_schema = Some(schema);
        self
    }
}

/// A capability declaration paired with its callable.
#[derive(Clone)]
pub struct CapabilityBinding {
    pub spec: CapabilitySpec,
    pub handler: Arc<dyn CapabilityHandler>,
}

impl CapabilityBinding {
    pub fn new(spec: CapabilitySpec, handler: Arc<dyn CapabilityHandler>) -> Self {
        Self { spec, handler }
    }
}

impl fmt::Debug for CapabilityBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityBinding")
            .field("spec", &self.spec)
            .field("handler", &"<handler>")
            .finish()
    }
}

/// A bundle of capabilities registered together.
pub trait CapabilityProvider: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    /// The (declaration, callable) pairs this provider exposes, in the order
    /// they should be listed.
    fn capabilities(&self) -> Vec<CapabilityBinding>;
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Immutable, registry-owned record of one capability.
#[derive(Clone)]
pub struct CapabilityDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub capability_type: CapabilityType,
    pub risk_level: RiskLevel,
    pub permissions: Vec<String>,
    pub tags: Vec<String>,
    pub cacheable: bool,
    pub cache_ttl: u64,
    pub rollback_supported: bool,
    pub snapshot_required: bool,
    pub confirm_required: bool,
    pub parameter_schema: Value,
    pub return_schema: Value,
    pub params: Vec<ParamBinding>,
    pub provider_id: String,
    pub handler: Arc<dyn CapabilityHandler>,
}

impl CapabilityDescriptor {
    /// Resolve a binding into a descriptor, applying the per-type defaults:
    /// only Context capabilities cache by default, and only Actions carry
    /// risk and rollback/snapshot/confirm flags.
    pub fn from_binding(binding: CapabilityBinding, provider_id: &str) -> Self {
        let CapabilityBinding { spec, handler } = binding;
        let is_context = spec.capability_type == CapabilityType::Context;
        let is_action = spec.capability_type == CapabilityType::Action;

        let cacheable = spec.cacheable.unwrap_or(is_context);
        let cache_ttl = match spec.cache_ttl {
            Some(ttl) => ttl,
            None if cacheable => DEFAULT_CONTEXT_CACHE_TTL,
            None => 0,
        };

        let parameter_schema = spec
            .parameter_schema
            .unwrap_or_else(|| schema_from_bindings(&spec.params));

        Self {
            id: spec.id,
            name: spec.name,
            description: spec.description,
            version: spec.version,
            capability_type: spec.capability_type,
            risk_level: if is_action { spec.risk_level } else { RiskLevel::Low },
            permissions: spec.permissions,
            tags: spec.tags,
            cacheable,
            cache_ttl,
            rollback_supported: is_action && spec.rollback_supported,
            snapshot_required: is_action && spec.snapshot_required,
            confirm_required: is_action && spec.confirm_required,
            parameter_schema,
            return_schema: spec.return_schema.unwrap_or(Value::Null),
            params: spec.params,
            provider_id: provider_id.to_string(),
            handler,
        }
    }

    /// Externally visible metadata.
    pub fn manifest(&self) -> CapabilityManifest {
        CapabilityManifest {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            capability_type: self.capability_type,
            provider_id: self.provider_id.clone(),
            permissions: self.permissions.clone(),
            tags: self.tags.clone(),
            risk_level: self.risk_level,
            rollback_supported: self.rollback_supported,
            snapshot_required: self.snapshot_required,
            confirm_required: self.confirm_required,
            cacheable: self.cacheable,
            cache_ttl: self.cache_ttl,
            parameter_schema: self.parameter_schema.clone(),
            return_schema: self.return_schema.clone(),
        }
    }
}

impl fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("id", &self.id)
            .field("type", &self.capability_type)
            .field("risk_level", &self.risk_level)
            .field("permissions", &self.permissions)
            .field("provider_id", &self.provider_id)
            .finish_non_exhaustive()
    }
}

/// Capability metadata as sent to gateways in `auth_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityManifest {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    #[serde(rename = "type")]
    pub capability_type: CapabilityType,
    pub provider_id: String,
    pub permissions: Vec<String>,
    pub tags: Vec<String>,
    pub risk_level: RiskLevel,
    pub rollback_supported: bool,
    pub snapshot_required: bool,
    pub confirm_required: bool,
    pub cacheable: bool,
    pub cache_ttl: u64,
    pub parameter_schema: Value,
    pub return_schema: Value,
}
