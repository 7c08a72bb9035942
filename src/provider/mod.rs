//! Provider capability interface and registry.
//!
//! Each external source is one implementation of [`ProviderCapability`]: it
//! knows how to search, resolve, and list chapters on that site, returning
//! raw `(canonical entity, provider link)` pairs that the reconciler merges.
//! Implementations live outside this crate; the crate owns only the
//! interface, the name-keyed [`ProviderRegistry`], and the fan-out
//! [`GlobalProvider`].
//!
//! The registry is constructed once at startup and passed to whatever needs
//! it — there is no process-wide provider list, so tests build their own.

mod global;
mod registry;

pub use global::GlobalProvider;
pub use registry::ProviderRegistry;

use async_trait::async_trait;
use thiserror::Error;

use crate::fetch::FetchError;
use crate::model::{Chapter, Manga, ProviderLink};

/// A provider's view of a manga: the canonical entity it parsed plus its own
/// identity for it.
#[derive(Debug, Clone)]
pub struct ProviderManga {
    /// Parsed canonical record (provider links not yet attached).
    pub manga: Manga,
    /// The provider's identity for this record.
    pub link: ProviderLink,
}

/// A provider's view of a chapter.
#[derive(Debug, Clone)]
pub struct ProviderChapter {
    /// Parsed chapter record.
    pub chapter: Chapter,
    /// The provider's identity for this chapter.
    pub link: ProviderLink,
}

/// Errors surfaced by provider implementations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The underlying fetch failed after retries.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The provider's page/API had an unexpected shape.
    #[error("{provider}: failed to parse response: {message}")]
    Parse {
        /// Provider that produced the unparseable response.
        provider: String,
        /// What was wrong with it.
        message: String,
    },

    /// No registered provider has the requested name.
    #[error("unknown provider: {name}")]
    UnknownProvider {
        /// The name that failed to resolve.
        name: String,
    },
}

impl ProviderError {
    /// Creates a parse error for a provider.
    pub fn parse(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates an unknown-provider error.
    pub fn unknown_provider(name: impl Into<String>) -> Self {
        Self::UnknownProvider { name: name.into() }
    }
}

/// One external source's capabilities.
///
/// Implementations fetch through the shared [`FetchClient`](crate::fetch::FetchClient)
/// with an appropriate request class, parse the provider's own format, and
/// return canonical entities paired with provider identities. Parse failures
/// for individual items are skipped and logged inside the implementation;
/// only whole-call failures surface as errors.
///
/// # Object Safety
///
/// Uses `async_trait` so the registry can hold `Arc<dyn ProviderCapability>`.
#[async_trait]
pub trait ProviderCapability: Send + Sync {
    /// Stable provider name ("mangadex", "flamecomics", ...).
    fn name(&self) -> &str;

    /// Base hostnames this provider owns, used to route free-form URLs.
    fn hostnames(&self) -> &[String];

    /// Languages this provider can list chapters in.
    fn languages(&self) -> &[String];

    /// Searches the provider for series matching a title query.
    async fn search_by_title(&self, query: &str) -> Result<Vec<ProviderManga>, ProviderError>;

    /// Resolves a series page URL to a canonical entity, if the URL is one.
    async fn resolve_by_url(&self, url: &str) -> Result<Option<ProviderManga>, ProviderError>;

    /// Resolves the provider's own foreign key to a canonical entity.
    async fn resolve_by_id(
        &self,
        foreign_key: &str,
    ) -> Result<Option<ProviderManga>, ProviderError>;

    /// Lists a series' chapters, optionally restricted to a language.
    async fn list_chapters(
        &self,
        manga_link: &ProviderLink,
        language: Option<&str>,
    ) -> Result<Vec<ProviderChapter>, ProviderError>;

    /// Returns the ordered page image URLs for a chapter.
    async fn chapter_image_urls(
        &self,
        chapter_link: &ProviderLink,
    ) -> Result<Vec<String>, ProviderError>;
}
