//! The "global" meta-provider: registry-aware fan-out over every enabled
//! provider.
//!
//! `search_by_title` dispatches one concurrent call per provider and joins
//! them all — a provider that errors or times out contributes an empty
//! result instead of aborting the join. `resolve_by_url` routes to the
//! single provider owning the URL's hostname rather than fanning out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, instrument, warn};

use super::{
    ProviderCapability, ProviderChapter, ProviderError, ProviderManga, ProviderRegistry,
};
use crate::model::ProviderLink;

/// Default per-provider budget for a fan-out search.
const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry-aware provider that fans searches out across all providers.
///
/// Implements [`ProviderCapability`] itself so callers can treat "search
/// everywhere" like any other provider.
#[derive(Debug)]
pub struct GlobalProvider {
    registry: Arc<ProviderRegistry>,
    search_timeout: Duration,
    hostnames: Vec<String>,
    languages: Vec<String>,
}

impl GlobalProvider {
    /// Creates the meta-provider over a registry.
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
            hostnames: Vec::new(),
            languages: Vec::new(),
        }
    }

    /// Overrides the per-provider search timeout.
    #[must_use]
    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout = timeout;
        self
    }

    /// Routes a chapter/manga link back to the provider that produced it.
    fn provider_for_link(
        &self,
        link: &ProviderLink,
    ) -> Result<Arc<dyn ProviderCapability>, ProviderError> {
        self.registry.require(&link.provider)
    }
}

#[async_trait]
impl ProviderCapability for GlobalProvider {
    fn name(&self) -> &str {
        "global"
    }

    fn hostnames(&self) -> &[String] {
        // Owns no hostnames: URL routing always goes to a concrete provider.
        &self.hostnames
    }

    fn languages(&self) -> &[String] {
        &self.languages
    }

    /// Fans the query out to every provider, joins all calls, and
    /// deduplicates by canonical manga key.
    #[instrument(skip(self))]
    async fn search_by_title(&self, query: &str) -> Result<Vec<ProviderManga>, ProviderError> {
        let providers: Vec<Arc<dyn ProviderCapability>> = self.registry.providers().collect();
        let timeout = self.search_timeout;

        let searches = providers.iter().map(|provider| {
            let provider = Arc::clone(provider);
            let query = query.to_string();
            async move {
                let name = provider.name().to_string();
                match tokio::time::timeout(timeout, provider.search_by_title(&query)).await {
                    Ok(Ok(results)) => (name, results),
                    Ok(Err(error)) => {
                        warn!(provider = %name, error = %error, "provider search failed");
                        (name, Vec::new())
                    }
                    Err(_) => {
                        warn!(provider = %name, timeout_secs = timeout.as_secs(), "provider search timed out");
                        (name, Vec::new())
                    }
                }
            }
        });

        // Joins every dispatched call, success or failure, before returning.
        let completed = join_all(searches).await;

        let mut seen_keys = std::collections::HashSet::new();
        let mut merged = Vec::new();
        for (provider, results) in completed {
            debug!(provider = %provider, results = results.len(), "fan-out search results");
            for result in results {
                if seen_keys.insert(result.manga.key.clone()) {
                    merged.push(result);
                } else {
                    debug!(
                        provider = %provider,
                        key = %result.manga.key,
                        "dropping duplicate canonical entity from fan-out"
                    );
                }
            }
        }
        Ok(merged)
    }

    /// Routes to the provider owning the URL's hostname; `Ok(None)` when no
    /// provider owns it.
    #[instrument(skip(self))]
    async fn resolve_by_url(&self, url: &str) -> Result<Option<ProviderManga>, ProviderError> {
        match self.registry.route_url(url) {
            Some(provider) => provider.resolve_by_url(url).await,
            None => {
                debug!(url, "no provider owns this hostname");
                Ok(None)
            }
        }
    }

    /// The global provider has no foreign-key namespace of its own.
    async fn resolve_by_id(
        &self,
        _foreign_key: &str,
    ) -> Result<Option<ProviderManga>, ProviderError> {
        Ok(None)
    }

    async fn list_chapters(
        &self,
        manga_link: &ProviderLink,
        language: Option<&str>,
    ) -> Result<Vec<ProviderChapter>, ProviderError> {
        self.provider_for_link(manga_link)?
            .list_chapters(manga_link, language)
            .await
    }

    async fn chapter_image_urls(
        &self,
        chapter_link: &ProviderLink,
    ) -> Result<Vec<String>, ProviderError> {
        self.provider_for_link(chapter_link)?
            .chapter_image_urls(chapter_link)
            .await
    }
}
