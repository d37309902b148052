//! # Capability Registry
//!
//! Capabilities are the host operations this agent exposes to remote
//! orchestrators. Each one is classified as Context (read-only query), Action
//! (mutating) or Event (notification source), and carries the permissions and
//! risk tier the execution pipeline enforces.
//!
//! ## Registration Flow
//!
//! 1. A host module implements [`CapabilityProvider`], returning a list of
//!    [`CapabilityBinding`]s (declaration + callable). No introspection is
//!    involved: the binding table for each capability's parameters is part of
//!    the declaration.
//! 2. `CapabilityRegistry::register(provider, owner)` resolves the bindings
//!    into [`CapabilityDescriptor`]s and publishes them atomically.
//! 3. The execution engine resolves descriptors by id; gateways receive
//!    [`CapabilityManifest`]s.
//! 4. When the owning module goes away, `unregister_all_owned_by(owner)`
//!    removes everything it contributed.

pub mod binding;
pub mod capability;
pub mod registry;

pub use binding::{bind_arguments, coerce, BoundArgs, ParamBinding, ParamKind};
pub use capability::{
    handler_fn, CapabilityBinding, CapabilityDescriptor, CapabilityHandler, CapabilityManifest,
    CapabilityProvider, CapabilitySpec, CapabilityType, RiskLevel,
};
pub use registry::{CapabilityRegistry, ProviderDescriptor, RegistryError};
