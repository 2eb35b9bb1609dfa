//! Provider registry
//!
//! Maps provider kind tags to factory functions, so the set of available
//! provider implementations is fixed at startup instead of being looked up by
//! name at runtime. New kinds are added with [`ProviderRegistry::register`].

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Instrument, debug, info, info_span, warn};

use super::{Provider, ProviderBackend};
use crate::cache::ChannelCache;
use crate::config::{ProviderConfig, Settings};
use crate::errors::{ProviderError, ProviderResult};

/// Builds a backend from its provider configuration
pub type ProviderFactory = fn(&ProviderConfig, &Settings) -> ProviderResult<Arc<dyn ProviderBackend>>;

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.kinds().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled provider kinds
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(super::xmltv::KIND, super::xmltv::XmltvBackend::factory);
        registry
    }

    /// Register (or replace) the factory for `kind`. Tags are case-insensitive.
    pub fn register(&mut self, kind: &str, factory: ProviderFactory) -> &mut Self {
        let kind = kind.to_uppercase();
        if self.factories.insert(kind.clone(), factory).is_some() {
            debug!("Replaced provider factory for kind {}", kind);
        }
        self
    }

    pub fn is_supported(&self, kind: &str) -> bool {
        self.factories.contains_key(&kind.to_uppercase())
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate one provider
    pub fn create(
        &self,
        config: &ProviderConfig,
        settings: &Arc<Settings>,
    ) -> ProviderResult<Provider> {
        let kind = config.kind();
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| ProviderError::UnknownKind {
                provider: config.name.clone(),
                kind: kind.clone(),
            })?;
        let backend = factory(config, settings)?;
        Ok(Provider::new(config.clone(), settings.clone(), backend))
    }

    /// Instantiate every enabled provider, in configuration order.
    ///
    /// Disabled providers and providers that fail to build are logged and
    /// skipped; one bad entry never prevents the others from running.
    pub fn load_providers(
        &self,
        configs: &[ProviderConfig],
        settings: &Arc<Settings>,
    ) -> Vec<Provider> {
        let mut providers = Vec::with_capacity(configs.len());
        for config in configs {
            if !config.enabled {
                debug!("[{}] Provider disabled, skipping", config.name);
                continue;
            }
            match self.create(config, settings) {
                Ok(provider) => providers.push(provider),
                Err(e) => warn!("[{}] Skipping provider: {}", config.name, e),
            }
        }
        info!("Loaded {} of {} configured providers", providers.len(), configs.len());
        providers
    }
}

/// Populate every provider's service channels from the cache or live
/// discovery, then write refreshed lists back into `cache`.
///
/// With `workers > 1` discovery runs concurrently. Providers only read the
/// cache during discovery; it is updated once every provider is done.
/// Returns whether any entry changed, i.e. whether the snapshot should be
/// saved.
pub async fn load_channels(
    providers: &mut [Provider],
    cache: &mut ChannelCache,
    workers: usize,
) -> bool {
    {
        let snapshot: &ChannelCache = cache;
        stream::iter(providers.iter_mut())
            .for_each_concurrent(workers.max(1), |provider| {
                let span = info_span!("provider", name = %provider.name());
                async move { provider.load_svc_channels(snapshot).await }.instrument(span)
            })
            .await;
    }

    let mut updated = false;
    for provider in providers.iter().filter(|p| p.channels_updated()) {
        cache.insert(&provider.cache_key(), provider.svc_channels().to_vec());
        updated = true;
    }
    if updated {
        debug!("Channel cache has refreshed entries");
    }
    updated
}
