//! Capability Registry: the index of every registered provider and capability.
//!
//! The registry keeps two indices, by capability id and by provider id, inside
//! a single immutable [`Snapshot`]. Writers build a new snapshot and swap it in
//! under a write mutex; readers clone the current `Arc` and never wait on a
//! writer for longer than the pointer swap. A provider's capabilities are
//! therefore visible all together or not at all.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use super::capability::{
    CapabilityDescriptor, CapabilityManifest, CapabilityProvider,
};

/// Errors raised by [`CapabilityRegistry::register`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Provider with ID '{0}' is already registered")]
    DuplicateProvider(String),

    #[error("Capability '{capability_id}' from provider '{provider_id}' is already registered")]
    DuplicateCapability {
        capability_id: String,
        provider_id: String,
    },

    #[error("Invalid provider: {0}")]
    InvalidProvider(String),
}

/// A registered provider and the capabilities it contributed.
#[derive(Clone)]
pub struct ProviderDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    /// The module that registered the provider.
    pub owner: String,
    pub capabilities: Vec<Arc<CapabilityDescriptor>>,
    pub instance: Arc<dyn CapabilityProvider>,
}

impl fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("owner", &self.owner)
            .field(
                "capabilities",
                &self.capabilities.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Default, Clone)]
struct Snapshot {
    capabilities: HashMap<String, Arc<CapabilityDescriptor>>,
    providers: HashMap<String, Arc<ProviderDescriptor>>,
    /// Provider ids in registration order.
    provider_order: Vec<String>,
}

/// Concurrent capability registry.
#[derive(Default)]
pub struct CapabilityRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
    write_lock: Mutex<()>,
}

impl CapabilityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Register a provider and all of its capabilities.
    ///
    /// Fails without publishing anything if the provider id is taken or any
    /// of its capability ids collides with an existing one.
    pub fn register(
        &self,
        provider: Arc<dyn CapabilityProvider>,
        owner: &str,
    ) -> Result<Arc<ProviderDescriptor>, RegistryError> {
        let provider_id = provider.id().to_string();
        if provider_id.is_empty() || provider.name().is_empty() || provider.version().is_empty() {
            return Err(RegistryError::InvalidProvider(format!(
                "provider '{}' must declare an id, name and version",
                provider_id
            )));
        }

        let bindings = provider.capabilities();
        if bindings.is_empty() {
            log::warn!("Provider {} declares no capabilities", provider_id);
        }

        let _guard = self.write_lock.lock();
        let current = self.current();

        if current.providers.contains_key(&provider_id) {
            return Err(RegistryError::DuplicateProvider(provider_id));
        }

        let mut descriptors = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let capability_id = binding.spec.id.clone();
            let duplicate_in_batch = descriptors
                .iter()
                .any(|d: &Arc<CapabilityDescriptor>| d.id == capability_id);
            if current.capabilities.contains_key(&capability_id) || duplicate_in_batch {
                return Err(RegistryError::DuplicateCapability {
                    capability_id,
                    provider_id,
                });
            }
            descriptors.push(Arc::new(CapabilityDescriptor::from_binding(
                binding,
                &provider_id,
            )));
        }

        let descriptor = Arc::new(ProviderDescriptor {
            id: provider_id.clone(),
            name: provider.name().to_string(),
            version: provider.version().to_string(),
            owner: owner.to_string(),
            capabilities: descriptors,
            instance: provider,
        });

        let mut next = (*current).clone();
        for capability in &descriptor.capabilities {
            next.capabilities
                .insert(capability.id.clone(), capability.clone());
        }
        next.providers.insert(provider_id.clone(), descriptor.clone());
        next.provider_order.push(provider_id.clone());
        *self.snapshot.write() = Arc::new(next);

        log::info!(
            "Registered provider: {} ({} capabilities)",
            provider_id,
            descriptor.capabilities.len()
        );
        Ok(descriptor)
    }

    /// Remove a provider and exactly its capabilities.
    ///
    /// Returns `false` (with a warning) when the provider is unknown.
    pub fn unregister(&self, provider_id: &str) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.current();
        if !current.providers.contains_key(provider_id) {
            log::warn!("Attempted to unregister unknown provider: {}", provider_id);
            return false;
        }
        let mut next = (*current).clone();
        Self::remove_provider(&mut next, provider_id);
        *self.snapshot.write() = Arc::new(next);
        log::info!("Unregistered provider: {}", provider_id);
        true
    }

    /// Remove every provider registered by `owner`. Returns how many were removed.
    pub fn unregister_all_owned_by(&self, owner: &str) -> usize {
        let _guard = self.write_lock.lock();
        let current = self.current();
        let owned: Vec<String> = current
            .provider_order
            .iter()
            .filter(|id| current.providers.get(*id).is_some_and(|p| p.owner == owner))
            .cloned()
            .collect();
        if owned.is_empty() {
            return 0;
        }

        let mut next = (*current).clone();
        for provider_id in &owned {
            Self::remove_provider(&mut next, provider_id);
        }
        *self.snapshot.write() = Arc::new(next);
        log::info!("Unregistered {} providers owned by {}", owned.len(), owner);
        owned.len()
    }

    fn remove_provider(snapshot: &mut Snapshot, provider_id: &str) {
        if let Some(provider) = snapshot.providers.remove(provider_id) {
            for capability in &provider.capabilities {
                snapshot.capabilities.remove(&capability.id);
            }
        }
        snapshot.provider_order.retain(|id| id != provider_id);
    }

    // -- reads --------------------------------------------------------------

    pub fn get_capability_descriptor(&self, capability_id: &str) -> Option<Arc<CapabilityDescriptor>> {
        self.current().capabilities.get(capability_id).cloned()
    }

    pub fn has_capability(&self, capability_id: &str) -> bool {
        self.current().capabilities.contains_key(capability_id)
    }

    /// All capabilities in provider order, then registration order.
    pub fn descriptors(&self) -> Vec<Arc<CapabilityDescriptor>> {
        let snapshot = self.current();
        snapshot
            .provider_order
            .iter()
            .filter_map(|id| snapshot.providers.get(id))
            .flat_map(|p| p.capabilities.iter().cloned())
            .collect()
    }

    /// Manifests of every registered capability.
    pub fn get_capabilities(&self) -> Vec<CapabilityManifest> {
        self.descriptors().iter().map(|c| c.manifest()).collect()
    }

    /// Manifests of one provider's capabilities; empty if the provider is unknown.
    pub fn get_provider_capabilities(&self, provider_id: &str) -> Vec<CapabilityManifest> {
        self.current()
            .providers
            .get(provider_id)
            .map(|p| p.capabilities.iter().map(|c| c.manifest()).collect())
            .unwrap_or_default()
    }

    /// Provider ids in registration order.
    pub fn get_provider_ids(&self) -> Vec<String> {
        self.current().provider_order.clone()
    }

    pub fn get_provider_descriptor(&self, provider_id: &str) -> Option<Arc<ProviderDescriptor>> {
        self.current().providers.get(provider_id).cloned()
    }

    pub fn capability_count(&self) -> usize {
        self.current().capabilities.len()
    }

    pub fn provider_count(&self) -> usize {
        self.current().providers.len()
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.current();
        f.debug_struct("CapabilityRegistry")
            .field("providers", &snapshot.provider_order)
            .field("capabilities", &snapshot.capabilities.len())
            .finish()
    }
}
