//! Persistence collaborator interface.
//!
//! The core keeps its working set in memory (the reconciler's identity map);
//! durable persistence is an external collaborator behind [`EntityStore`].
//! Implementations must preserve the reconciler's merge semantics: an upsert
//! replaces the stored record with the already-merged one, never shrinking
//! multi-valued fields on its own. [`MemoryStore`] is the in-process
//! implementation used by tests and the default daemon.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::model::{Chapter, Manga, MangaKey};

/// Errors from a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("store backend error: {message}")]
    Backend {
        /// Backend-specific description.
        message: String,
    },
}

impl StoreError {
    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Durable storage for canonical entities.
#[async_trait]
pub trait EntityStore: Send + Sync + std::fmt::Debug {
    /// Inserts or replaces a manga by its canonical key.
    async fn upsert_manga(&self, manga: &Manga) -> Result<(), StoreError>;

    /// Looks a manga up by canonical key.
    async fn find_by_key(&self, key: &MangaKey) -> Result<Option<Manga>, StoreError>;

    /// Looks a manga up by one of its provider links.
    async fn find_by_provider_link(
        &self,
        provider: &str,
        foreign_key: &str,
    ) -> Result<Option<Manga>, StoreError>;

    /// Replaces the stored chapter list of a manga.
    async fn upsert_chapters(
        &self,
        key: &MangaKey,
        chapters: &[Chapter],
    ) -> Result<(), StoreError>;
}

/// In-memory store used by tests and the default daemon.
#[derive(Debug, Default)]
pub struct MemoryStore {
    mangas: DashMap<MangaKey, Manga>,
    chapters: DashMap<MangaKey, Vec<Chapter>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored mangas.
    #[must_use]
    pub fn manga_count(&self) -> usize {
        self.mangas.len()
    }

    /// Returns the stored chapters of a manga.
    #[must_use]
    pub fn chapters(&self, key: &MangaKey) -> Vec<Chapter> {
        self.chapters
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn upsert_manga(&self, manga: &Manga) -> Result<(), StoreError> {
        self.mangas.insert(manga.key.clone(), manga.clone());
        Ok(())
    }

    async fn find_by_key(&self, key: &MangaKey) -> Result<Option<Manga>, StoreError> {
        Ok(self.mangas.get(key).map(|entry| entry.value().clone()))
    }

    async fn find_by_provider_link(
        &self,
        provider: &str,
        foreign_key: &str,
    ) -> Result<Option<Manga>, StoreError> {
        Ok(self
            .mangas
            .iter()
            .find(|entry| {
                entry.value().provider_ids.iter().any(|link| {
                    link.provider == provider && link.foreign_key == foreign_key
                })
            })
            .map(|entry| entry.value().clone()))
    }

    async fn upsert_chapters(
        &self,
        key: &MangaKey,
        chapters: &[Chapter],
    ) -> Result<(), StoreError> {
        self.chapters.insert(key.clone(), chapters.to_vec());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::ProviderLink;

    #[tokio::test]
    async fn test_upsert_and_find_by_key() {
        let store = MemoryStore::new();
        let manga = Manga::new("Berserk");
        store.upsert_manga(&manga).await.unwrap();

        let found = store.find_by_key(&manga.key).await.unwrap().unwrap();
        assert_eq!(found.name, "Berserk");
        assert!(store.find_by_key(&MangaKey::from_title("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_provider_link() {
        let store = MemoryStore::new();
        let mut manga = Manga::new("Berserk");
        manga.provider_ids.push(ProviderLink::new("alpha", "a-1"));
        store.upsert_manga(&manga).await.unwrap();

        let found = store
            .find_by_provider_link("alpha", "a-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.key, manga.key);
        assert!(store
            .find_by_provider_link("alpha", "other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_upsert_chapters_replaces() {
        let store = MemoryStore::new();
        let key = MangaKey::from_title("Berserk");
        let chapters = vec![Chapter::new(key.clone(), "1")];
        store.upsert_chapters(&key, &chapters).await.unwrap();
        assert_eq!(store.chapters(&key).len(), 1);

        store.upsert_chapters(&key, &[]).await.unwrap();
        assert!(store.chapters(&key).is_empty());
    }
}
