//! Entity reconciliation: merging provider results into canonical records.
//!
//! The reconciler owns the identity map from provider identities to
//! canonical [`Manga`]/[`Chapter`] records. Provider results are merged,
//! never copied over: scalar descriptive fields take the incoming
//! provider's value, multi-valued fields union and never shrink, and
//! provider links accumulate with at most one per provider per entity.
//!
//! Merges are serialized per canonical key — two providers resolving the
//! same title concurrently contend on that entity's lock, so neither
//! contribution is lost — while different entities reconcile in parallel.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::model::{self, Chapter, Manga, MangaKey, ProviderLink, ReleaseStatus};
use crate::provider::{ProviderChapter, ProviderManga};
use crate::store::{EntityStore, StoreError};

/// Errors from reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The persistence collaborator failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No canonical entity exists under the given key.
    #[error("unknown manga: {key}")]
    UnknownManga {
        /// The key that failed to resolve.
        key: MangaKey,
    },
}

/// What one chapter batch reconcile did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChapterReport {
    /// Chapters newly added to the canonical list.
    pub added: usize,
    /// Incoming chapters merged into an existing canonical chapter.
    pub merged: usize,
    /// Chapters whose number has no numeric token (kept, but never "new").
    pub unparseable: usize,
}

/// A canonical entity and its chapters, guarded together so manga and
/// chapter merges for one key serialize on one lock.
#[derive(Debug)]
struct MangaEntry {
    manga: Manga,
    chapters: Vec<Chapter>,
}

/// The identity map and merge engine.
#[derive(Debug)]
pub struct Reconciler {
    store: Arc<dyn EntityStore>,
    entries: DashMap<MangaKey, Arc<Mutex<MangaEntry>>>,
    by_link: DashMap<(String, String), MangaKey>,
}

impl Reconciler {
    /// Creates a reconciler pushing merged state through the given store.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            by_link: DashMap::new(),
        }
    }

    /// Merges a provider's manga result into the canonical record it maps
    /// to, creating one when the provider identity is new.
    ///
    /// Canonical identity resolution: an existing `(provider, foreign_key)`
    /// link wins; otherwise the incoming record's own key (derived from its
    /// normalized title) decides which canonical entity it lands in. The
    /// canonical key never changes once assigned.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Store`] when the persistence collaborator
    /// rejects the merged record.
    #[instrument(skip(self, incoming), fields(provider = %incoming.link.provider))]
    pub async fn reconcile_manga(
        &self,
        incoming: ProviderManga,
    ) -> Result<Manga, ReconcileError> {
        let ProviderManga { manga, link } = incoming;
        let link_key = (link.provider.clone(), link.foreign_key.clone());
        let key = self
            .by_link
            .get(&link_key)
            .map_or_else(|| manga.key.clone(), |entry| entry.value().clone());

        // Clone the Arc so the DashMap shard lock is released before awaiting.
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(key = %key, "creating canonical entity");
                Arc::new(Mutex::new(MangaEntry {
                    manga: empty_manga(key.clone()),
                    chapters: Vec::new(),
                }))
            })
            .clone();

        let mut guard = entry.lock().await;
        merge_manga(&mut guard.manga, manga, link);
        self.by_link.insert(link_key, key);
        self.store.upsert_manga(&guard.manga).await?;
        Ok(guard.manga.clone())
    }

    /// Merges a batch of provider chapters into a manga's canonical list.
    ///
    /// Duplicates across providers (same normalized `(volume, number)`) are
    /// merged, not duplicated. When two providers disagree on the volume for
    /// the same number, the manga's download provider wins. Chapters without
    /// a numeric number are kept for display but counted as unparseable and
    /// never participate in ordering or new-chapter detection.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::UnknownManga`] when the key has never been
    /// reconciled, or [`ReconcileError::Store`] from persistence.
    #[instrument(skip(self, incoming), fields(key = %key, incoming = incoming.len()))]
    pub async fn reconcile_chapters(
        &self,
        key: &MangaKey,
        incoming: Vec<ProviderChapter>,
    ) -> Result<ChapterReport, ReconcileError> {
        let entry = self.entry(key)?;
        let mut guard = entry.lock().await;
        let mut report = ChapterReport::default();

        for ProviderChapter { mut chapter, link } in incoming {
            chapter.manga_key = key.clone();
            if !chapter.number.is_numeric() {
                report.unparseable += 1;
                warn!(
                    key = %key,
                    number = chapter.number.as_str(),
                    provider = %link.provider,
                    "chapter number has no numeric token; excluded from ordering"
                );
            }

            let download_provider = guard
                .manga
                .download_link()
                .map(|l| l.provider.clone());

            if let Some(existing) = find_chapter_mut(&mut guard.chapters, &chapter) {
                if existing.volume != chapter.volume
                    && download_provider.as_deref() == Some(link.provider.as_str())
                {
                    // Conflicting volume claims: the download provider wins.
                    existing.volume = chapter.volume;
                }
                if existing.title.is_none() {
                    existing.title = chapter.title;
                }
                upsert_link(&mut existing.provider_ids, link);
                report.merged += 1;
            } else {
                upsert_link(&mut chapter.provider_ids, link);
                guard.chapters.push(chapter);
                report.added += 1;
            }
        }

        self.store.upsert_chapters(key, &guard.chapters).await?;
        debug!(?report, "chapter batch reconciled");
        Ok(report)
    }

    /// Returns a snapshot of a canonical manga.
    pub async fn manga(&self, key: &MangaKey) -> Option<Manga> {
        let entry = Arc::clone(self.entries.get(key)?.value());
        let guard = entry.lock().await;
        Some(guard.manga.clone())
    }

    /// Returns a snapshot of a manga's canonical chapter list.
    pub async fn chapters(&self, key: &MangaKey) -> Vec<Chapter> {
        match self.entries.get(key).map(|e| Arc::clone(e.value())) {
            Some(entry) => entry.lock().await.chapters.clone(),
            None => Vec::new(),
        }
    }

    /// Returns the chapters eligible for download, in reading order.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::UnknownManga`] when the key has never been
    /// reconciled.
    pub async fn new_chapters(&self, key: &MangaKey) -> Result<Vec<Chapter>, ReconcileError> {
        let entry = self.entry(key)?;
        let guard = entry.lock().await;
        Ok(model::new_chapters(&guard.manga, &guard.chapters))
    }

    /// Sets the new-chapter cutoff for a manga.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::UnknownManga`] when the key has never been
    /// reconciled.
    pub async fn set_cutoff(&self, key: &MangaKey, cutoff: f64) -> Result<(), ReconcileError> {
        let entry = self.entry(key)?;
        let mut guard = entry.lock().await;
        guard.manga.ignore_chapters_before = cutoff;
        self.store.upsert_manga(&guard.manga).await?;
        Ok(())
    }

    /// Marks a chapter downloaded, recording its archive file name.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::UnknownManga`] when the key has never been
    /// reconciled.
    pub async fn mark_downloaded(
        &self,
        key: &MangaKey,
        number: &crate::model::ChapterNumber,
        file_name: impl Into<String> + Send,
    ) -> Result<(), ReconcileError> {
        let entry = self.entry(key)?;
        let mut guard = entry.lock().await;
        if let Some(chapter) = guard
            .chapters
            .iter_mut()
            .find(|c| numbers_equal(&c.number, number))
        {
            chapter.downloaded = true;
            chapter.file_name = Some(file_name.into());
        }
        self.store.upsert_chapters(key, &guard.chapters).await?;
        Ok(())
    }

    /// Number of canonical entities held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been reconciled yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, key: &MangaKey) -> Result<Arc<Mutex<MangaEntry>>, ReconcileError> {
        self.entries
            .get(key)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ReconcileError::UnknownManga { key: key.clone() })
    }
}

/// A fresh canonical record waiting for its first merge.
fn empty_manga(key: MangaKey) -> Manga {
    let mut manga = Manga::new("");
    manga.key = key;
    manga
}

/// Merges an incoming provider view into the canonical record.
///
/// Scalar descriptive fields take the incoming value when it is present;
/// multi-valued fields union; the canonical key is never touched. A renamed
/// primary title keeps the old name as an alt title.
fn merge_manga(existing: &mut Manga, incoming: Manga, link: ProviderLink) {
    if !incoming.name.is_empty() {
        if !existing.name.is_empty() && existing.name != incoming.name {
            existing.alt_titles.insert(existing.name.clone());
        }
        existing.name = incoming.name;
    }
    if incoming.description.is_some() {
        existing.description = incoming.description;
    }
    if incoming.cover_url.is_some() {
        existing.cover_url = incoming.cover_url;
    }
    if incoming.status != ReleaseStatus::Unknown {
        existing.status = incoming.status;
    }
    if incoming.year.is_some() {
        existing.year = incoming.year;
    }

    existing.authors.extend(incoming.authors);
    existing.tags.extend(incoming.tags);
    existing.alt_titles.extend(incoming.alt_titles);
    existing.links.extend(incoming.links);

    upsert_link(&mut existing.provider_ids, link);
}

/// Adds a provider link, or updates the existing link for that provider.
///
/// The `(provider, foreign_key)` composite stays unique per entity: a second
/// result from the same provider re-points the existing link instead of
/// adding a duplicate. The first link ever added becomes the download
/// source unless one is already flagged.
fn upsert_link(links: &mut Vec<ProviderLink>, incoming: ProviderLink) {
    if let Some(existing) = links.iter_mut().find(|l| l.provider == incoming.provider) {
        existing.foreign_key = incoming.foreign_key;
        if incoming.website_url.is_some() {
            existing.website_url = incoming.website_url;
        }
    } else {
        links.push(incoming);
    }
    if !links.iter().any(|l| l.use_for_download) {
        if let Some(first) = links.first_mut() {
            first.use_for_download = true;
        }
    }
}

/// Finds the canonical chapter an incoming chapter collapses into.
///
/// Exact `(volume, number)` match first; failing that, a number-only match
/// so that providers disagreeing on volume still merge (the caller settles
/// the volume by provider precedence).
fn find_chapter_mut<'a>(
    chapters: &'a mut [Chapter],
    incoming: &Chapter,
) -> Option<&'a mut Chapter> {
    let exact = chapters
        .iter()
        .position(|c| c.volume == incoming.volume && numbers_equal(&c.number, &incoming.number));
    let index = exact.or_else(|| {
        chapters
            .iter()
            .position(|c| numbers_equal(&c.number, &incoming.number))
    })?;
    chapters.get_mut(index)
}

/// Chapter numbers are equal when their numeric values match, falling back
/// to raw-token equality for unparseable numbers.
fn numbers_equal(a: &crate::model::ChapterNumber, b: &crate::model::ChapterNumber) -> bool {
    match (a.value(), b.value()) {
        (Some(va), Some(vb)) => (va - vb).abs() < f64::EPSILON,
        (None, None) => a.as_str() == b.as_str(),
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::ChapterNumber;
    use crate::store::MemoryStore;

    fn reconciler() -> Reconciler {
        Reconciler::new(Arc::new(MemoryStore::new()))
    }

    fn provider_manga(provider: &str, foreign_key: &str, title: &str) -> ProviderManga {
        ProviderManga {
            manga: Manga::new(title),
            link: ProviderLink::new(provider, foreign_key)
                .with_url(format!("https://{provider}.example/title/{foreign_key}")),
        }
    }

    fn provider_chapter(
        key: &MangaKey,
        provider: &str,
        volume: Option<i32>,
        number: &str,
    ) -> ProviderChapter {
        let mut chapter = Chapter::new(key.clone(), number);
        chapter.volume = volume;
        ProviderChapter {
            chapter,
            link: ProviderLink::new(provider, format!("{provider}-{number}")),
        }
    }

    #[tokio::test]
    async fn test_reconcile_same_result_twice_is_idempotent() {
        let reconciler = reconciler();
        let first = reconciler
            .reconcile_manga(provider_manga("alpha", "a-1", "Berserk"))
            .await
            .unwrap();
        let second = reconciler
            .reconcile_manga(provider_manga("alpha", "a-1", "Berserk"))
            .await
            .unwrap();

        assert_eq!(reconciler.len(), 1);
        assert_eq!(first.key, second.key);
        assert_eq!(second.provider_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_two_providers_same_title_merge_into_one() {
        let reconciler = reconciler();
        let mut from_alpha = provider_manga("alpha", "a-1", "Berserk");
        from_alpha.manga.tags.insert("seinen".to_string());
        from_alpha.manga.authors.insert("Kentaro Miura".to_string());
        let mut from_beta = provider_manga("beta", "b-9", "berserk");
        from_beta.manga.tags.insert("dark fantasy".to_string());
        from_beta.manga.authors.insert("Kentaro Miura".to_string());

        reconciler.reconcile_manga(from_alpha).await.unwrap();
        let merged = reconciler.reconcile_manga(from_beta).await.unwrap();

        assert_eq!(reconciler.len(), 1);
        assert_eq!(merged.provider_ids.len(), 2);
        assert!(merged.tags.contains("seinen"));
        assert!(merged.tags.contains("dark fantasy"));
        assert_eq!(merged.authors.len(), 1);
    }

    #[tokio::test]
    async fn test_incoming_scalars_win_but_sets_never_shrink() {
        let reconciler = reconciler();
        let mut first = provider_manga("alpha", "a-1", "Berserk");
        first.manga.description = Some("old description".to_string());
        first.manga.tags.insert("seinen".to_string());
        reconciler.reconcile_manga(first).await.unwrap();

        // Second view has a newer description but fewer tags.
        let mut second = provider_manga("alpha", "a-1", "Berserk");
        second.manga.description = Some("new description".to_string());
        let merged = reconciler.reconcile_manga(second).await.unwrap();

        assert_eq!(merged.description.as_deref(), Some("new description"));
        assert!(merged.tags.contains("seinen"), "sets must never shrink");
    }

    #[tokio::test]
    async fn test_same_provider_repoints_link_instead_of_duplicating() {
        let reconciler = reconciler();
        reconciler
            .reconcile_manga(provider_manga("alpha", "a-1", "Berserk"))
            .await
            .unwrap();
        let merged = reconciler
            .reconcile_manga(provider_manga("alpha", "a-2", "Berserk"))
            .await
            .unwrap();

        assert_eq!(merged.provider_ids.len(), 1);
        assert_eq!(merged.provider_ids[0].foreign_key, "a-2");
    }

    #[tokio::test]
    async fn test_first_link_becomes_download_source() {
        let reconciler = reconciler();
        reconciler
            .reconcile_manga(provider_manga("alpha", "a-1", "Berserk"))
            .await
            .unwrap();
        let merged = reconciler
            .reconcile_manga(provider_manga("beta", "b-1", "berserk"))
            .await
            .unwrap();

        assert!(merged.provider_link("alpha").unwrap().use_for_download);
        assert!(!merged.provider_link("beta").unwrap().use_for_download);
    }

    #[tokio::test]
    async fn test_chapter_dedupe_across_providers() {
        let reconciler = reconciler();
        let manga = reconciler
            .reconcile_manga(provider_manga("alpha", "a-1", "Berserk"))
            .await
            .unwrap();

        let report = reconciler
            .reconcile_chapters(
                &manga.key,
                vec![
                    provider_chapter(&manga.key, "alpha", Some(1), "1"),
                    provider_chapter(&manga.key, "alpha", Some(1), "2"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(report.added, 2);

        // Beta lists the same two chapters: merged, not duplicated.
        let report = reconciler
            .reconcile_chapters(
                &manga.key,
                vec![
                    provider_chapter(&manga.key, "beta", Some(1), "1"),
                    provider_chapter(&manga.key, "beta", Some(1), "2.0"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(report.merged, 2);
        assert_eq!(report.added, 0);

        let chapters = reconciler.chapters(&manga.key).await;
        assert_eq!(chapters.len(), 2);
        assert!(chapters.iter().all(|c| c.provider_ids.len() == 2));
    }

    #[tokio::test]
    async fn test_volume_conflict_download_provider_wins() {
        let reconciler = reconciler();
        let manga = reconciler
            .reconcile_manga(provider_manga("alpha", "a-1", "Berserk"))
            .await
            .unwrap();

        // Beta (not the download provider) claims volume 2 first.
        reconciler
            .reconcile_chapters(
                &manga.key,
                vec![provider_chapter(&manga.key, "beta", Some(2), "5")],
            )
            .await
            .unwrap();
        // Alpha is the download provider and says volume 1.
        reconciler
            .reconcile_chapters(
                &manga.key,
                vec![provider_chapter(&manga.key, "alpha", Some(1), "5")],
            )
            .await
            .unwrap();

        let chapters = reconciler.chapters(&manga.key).await;
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].volume, Some(1));
    }

    #[tokio::test]
    async fn test_unparseable_chapters_counted_and_never_new() {
        let reconciler = reconciler();
        let manga = reconciler
            .reconcile_manga(provider_manga("alpha", "a-1", "Berserk"))
            .await
            .unwrap();

        let report = reconciler
            .reconcile_chapters(
                &manga.key,
                vec![
                    provider_chapter(&manga.key, "alpha", None, "oneshot"),
                    provider_chapter(&manga.key, "alpha", None, "3"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(report.unparseable, 1);

        let fresh = reconciler.new_chapters(&manga.key).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].number.as_str(), "3");
    }

    #[tokio::test]
    async fn test_cutoff_applies_to_new_chapters() {
        let reconciler = reconciler();
        let manga = reconciler
            .reconcile_manga(provider_manga("alpha", "a-1", "Berserk"))
            .await
            .unwrap();
        reconciler.set_cutoff(&manga.key, 5.0).await.unwrap();

        reconciler
            .reconcile_chapters(
                &manga.key,
                vec![
                    provider_chapter(&manga.key, "alpha", None, "5"),
                    provider_chapter(&manga.key, "alpha", None, "5.1"),
                ],
            )
            .await
            .unwrap();

        let fresh = reconciler.new_chapters(&manga.key).await.unwrap();
        let numbers: Vec<&str> = fresh.iter().map(|c| c.number.as_str()).collect();
        assert_eq!(numbers, vec!["5.1"]);
    }

    #[tokio::test]
    async fn test_mark_downloaded_removes_from_new() {
        let reconciler = reconciler();
        let manga = reconciler
            .reconcile_manga(provider_manga("alpha", "a-1", "Berserk"))
            .await
            .unwrap();
        reconciler
            .reconcile_chapters(
                &manga.key,
                vec![provider_chapter(&manga.key, "alpha", None, "1")],
            )
            .await
            .unwrap();

        reconciler
            .mark_downloaded(&manga.key, &ChapterNumber::new("1"), "Berserk c001.cbz")
            .await
            .unwrap();

        assert!(reconciler.new_chapters(&manga.key).await.unwrap().is_empty());
        let chapters = reconciler.chapters(&manga.key).await;
        assert_eq!(chapters[0].file_name.as_deref(), Some("Berserk c001.cbz"));
    }

    #[tokio::test]
    async fn test_concurrent_merges_lose_nothing() {
        let reconciler = Arc::new(reconciler());
        let mut handles = Vec::new();
        for provider in ["alpha", "beta", "gamma", "delta"] {
            let reconciler = Arc::clone(&reconciler);
            let mut incoming = provider_manga(provider, &format!("{provider}-1"), "Berserk");
            incoming.manga.tags.insert(format!("tag-{provider}"));
            handles.push(tokio::spawn(async move {
                reconciler.reconcile_manga(incoming).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let key = MangaKey::from_title("Berserk");
        let manga = reconciler.manga(&key).await.unwrap();
        assert_eq!(manga.provider_ids.len(), 4, "no provider contribution may be dropped");
        assert_eq!(manga.tags.len(), 4);
    }

    #[tokio::test]
    async fn test_chapters_for_unknown_manga_error() {
        let reconciler = reconciler();
        let key = MangaKey::from_title("ghost");
        assert!(matches!(
            reconciler.reconcile_chapters(&key, Vec::new()).await,
            Err(ReconcileError::UnknownManga { .. })
        ));
    }
}
