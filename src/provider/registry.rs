//! Name-keyed provider registry with hostname routing.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{ProviderCapability, ProviderError};

/// The set of enabled providers, keyed by name.
///
/// Built once at startup and handed to the scheduler and the global
/// meta-provider. Registration order is preserved for deterministic fan-out
/// and listing.
#[derive(Default)]
pub struct ProviderRegistry {
    by_name: HashMap<String, Arc<dyn ProviderCapability>>,
    order: Vec<String>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.order)
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under its own name.
    ///
    /// # Errors
    ///
    /// Returns an error when a provider with the same name is already
    /// registered.
    pub fn register(&mut self, provider: Arc<dyn ProviderCapability>) -> Result<(), ProviderError> {
        let name = provider.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(ProviderError::parse(
                &name,
                "provider registered twice under the same name",
            ));
        }
        debug!(
            name = %name,
            hostnames = ?provider.hostnames(),
            "registering provider"
        );
        self.order.push(name.clone());
        self.by_name.insert(name, provider);
        Ok(())
    }

    /// Looks a provider up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderCapability>> {
        self.by_name.get(name).cloned()
    }

    /// Like [`get`](Self::get), but failing with `UnknownProvider`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnknownProvider`] when no provider has the
    /// name.
    pub fn require(&self, name: &str) -> Result<Arc<dyn ProviderCapability>, ProviderError> {
        self.get(name)
            .ok_or_else(|| ProviderError::unknown_provider(name))
    }

    /// Routes a free-form URL to the single provider owning its hostname.
    ///
    /// A provider owns a hostname when the URL's host equals it or is a
    /// subdomain of it. Returns `None` for URLs nobody owns — callers treat
    /// that as a lookup miss, not an error.
    #[must_use]
    pub fn route_url(&self, url: &str) -> Option<Arc<dyn ProviderCapability>> {
        let host = url::Url::parse(url).ok()?.host_str()?.to_lowercase();
        self.providers().find(|provider| {
            provider.hostnames().iter().any(|owned| {
                let owned = owned.to_lowercase();
                host == owned || host.ends_with(&format!(".{owned}"))
            })
        })
    }

    /// Iterates providers in registration order.
    pub fn providers(&self) -> impl Iterator<Item = Arc<dyn ProviderCapability>> + '_ {
        self.order
            .iter()
            .filter_map(|name| self.by_name.get(name).cloned())
    }

    /// Returns the number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if no providers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
