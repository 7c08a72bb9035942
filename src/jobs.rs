//! Concrete worker bodies: the periodic jobs the daemon schedules per manga.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::covers::CoverCache;
use crate::downloads::{ChapterDownloader, DownloadOutcome};
use crate::model::MangaKey;
use crate::notify::PushSet;
use crate::scheduler::{Job, JobContext, JobError};

/// Refreshes a manga's chapter list from every provider that carries it.
///
/// Individual provider failures are logged and skipped — one broken
/// provider must not hide new chapters listed by the others. The job only
/// fails when the manga itself is unknown.
#[derive(Debug)]
pub struct CheckChaptersJob {
    key: MangaKey,
    language: Option<String>,
}

impl CheckChaptersJob {
    /// Creates the job for a manga, optionally restricted to one language.
    #[must_use]
    pub fn new(key: MangaKey, language: Option<String>) -> Self {
        Self { key, language }
    }
}

#[async_trait]
impl Job for CheckChaptersJob {
    #[instrument(skip(self, ctx), fields(key = %self.key))]
    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let manga = ctx
            .reconciler
            .manga(&self.key)
            .await
            .ok_or_else(|| JobError::failed(format!("manga {} not reconciled yet", self.key)))?;

        for link in &manga.provider_ids {
            let provider = match ctx.providers.get(&link.provider) {
                Some(provider) => provider,
                None => {
                    warn!(provider = %link.provider, "provider not registered; skipping link");
                    continue;
                }
            };
            match provider
                .list_chapters(link, self.language.as_deref())
                .await
            {
                Ok(chapters) => {
                    let report = ctx.reconciler.reconcile_chapters(&self.key, chapters).await?;
                    debug!(provider = %link.provider, ?report, "chapter list reconciled");
                }
                Err(error) => {
                    warn!(provider = %link.provider, error = %error, "chapter listing failed; skipping provider");
                }
            }
        }
        Ok(())
    }
}

/// Re-resolves a manga's metadata from each provider and refreshes its
/// cached cover.
#[derive(Debug)]
pub struct RefreshMetadataJob {
    key: MangaKey,
    covers: Option<Arc<CoverCache>>,
}

impl RefreshMetadataJob {
    /// Creates the job; pass a cover cache to refresh cover art too.
    #[must_use]
    pub fn new(key: MangaKey, covers: Option<Arc<CoverCache>>) -> Self {
        Self { key, covers }
    }
}

#[async_trait]
impl Job for RefreshMetadataJob {
    #[instrument(skip(self, ctx), fields(key = %self.key))]
    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let manga = ctx
            .reconciler
            .manga(&self.key)
            .await
            .ok_or_else(|| JobError::failed(format!("manga {} not reconciled yet", self.key)))?;

        for link in &manga.provider_ids {
            let Some(provider) = ctx.providers.get(&link.provider) else {
                continue;
            };
            match provider.resolve_by_id(&link.foreign_key).await {
                Ok(Some(result)) => {
                    ctx.reconciler.reconcile_manga(result).await?;
                }
                Ok(None) => {
                    warn!(provider = %link.provider, foreign_key = %link.foreign_key, "provider no longer knows this id");
                }
                Err(error) => {
                    warn!(provider = %link.provider, error = %error, "metadata refresh failed; skipping provider");
                }
            }
        }

        if let Some(covers) = &self.covers {
            if let Some(refreshed) = ctx.reconciler.manga(&self.key).await {
                let _cover = covers.get_or_fetch(&refreshed).await;
            }
        }
        Ok(())
    }
}

/// Downloads every chapter past the manga's cutoff that is not yet
/// archived, then fires library and notification pushes.
#[derive(Debug)]
pub struct DownloadNewChaptersJob {
    key: MangaKey,
    downloader: Arc<ChapterDownloader>,
    pushes: Arc<PushSet>,
}

impl DownloadNewChaptersJob {
    /// Creates the job.
    #[must_use]
    pub fn new(key: MangaKey, downloader: Arc<ChapterDownloader>, pushes: Arc<PushSet>) -> Self {
        Self {
            key,
            downloader,
            pushes,
        }
    }
}

#[async_trait]
impl Job for DownloadNewChaptersJob {
    #[instrument(skip(self, ctx), fields(key = %self.key))]
    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let manga = ctx
            .reconciler
            .manga(&self.key)
            .await
            .ok_or_else(|| JobError::failed(format!("manga {} not reconciled yet", self.key)))?;
        let fresh = ctx.reconciler.new_chapters(&self.key).await?;
        if fresh.is_empty() {
            debug!("no new chapters");
            return Ok(());
        }
        info!(chapters = fresh.len(), "downloading new chapters");

        let mut downloaded = 0usize;
        for chapter in &fresh {
            match self
                .downloader
                .download(&ctx.providers, &manga, chapter, &ctx.cancel)
                .await
            {
                Ok(DownloadOutcome::Completed { file_name }) => {
                    ctx.reconciler
                        .mark_downloaded(&self.key, &chapter.number, file_name)
                        .await?;
                    downloaded += 1;
                }
                Ok(DownloadOutcome::AlreadyArchived) => {
                    // Archive probing says it exists; record that.
                    ctx.reconciler
                        .mark_downloaded(&self.key, &chapter.number, format!("Ch.{}", chapter.number))
                        .await?;
                }
                Ok(DownloadOutcome::Cancelled) => {
                    info!(downloaded, "download run cancelled mid-sequence");
                    break;
                }
                Err(error) => {
                    // One broken chapter must not abort the batch.
                    warn!(number = chapter.number.as_str(), error = %error, "chapter download failed; continuing");
                }
            }
        }

        if downloaded > 0 {
            self.pushes.update_all().await;
            self.pushes
                .notify_all(
                    &manga.name,
                    &format!("{downloaded} new chapter(s) downloaded"),
                )
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;
    use crate::downloads::FolderArchiveWriter;
    use crate::fetch::{FetchClient, HttpTransport, RateLimit, RateLimiter, RetryPolicy};
    use crate::model::{Manga, ProviderLink};
    use crate::provider::test_support::ScriptedProvider;
    use crate::provider::{ProviderManga, ProviderRegistry};
    use crate::reconcile::Reconciler;
    use crate::store::MemoryStore;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context_with(registry: ProviderRegistry) -> JobContext {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        JobContext {
            providers: Arc::new(registry),
            fetch: Arc::new(FetchClient::new(
                Arc::new(HttpTransport::new()),
                Arc::new(RateLimiter::new(RateLimit::new(100, Duration::from_millis(10)))),
                RetryPolicy::with_max_attempts(1),
            )),
            reconciler: Arc::new(Reconciler::new(Arc::clone(&store) as _)),
            store,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn seed_manga(ctx: &JobContext, provider: &str) -> MangaKey {
        let seeded = ctx
            .reconciler
            .reconcile_manga(ProviderManga {
                manga: Manga::new("Berserk"),
                link: ProviderLink::new(provider, "a-1"),
            })
            .await
            .unwrap();
        seeded.key
    }

    #[tokio::test]
    async fn test_check_chapters_reconciles_provider_listing() {
        let provider = ScriptedProvider::new("alpha", &["alpha.example"])
            .with_series("Berserk", "a-1")
            .with_chapter(Some(1), "1")
            .with_chapter(Some(1), "2");
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(provider)).unwrap();
        let ctx = context_with(registry);

        let key = seed_manga(&ctx, "alpha").await;
        CheckChaptersJob::new(key.clone(), None)
            .execute(&ctx)
            .await
            .unwrap();

        assert_eq!(ctx.reconciler.chapters(&key).await.len(), 2);
    }

    #[tokio::test]
    async fn test_check_chapters_skips_broken_provider() {
        let good = ScriptedProvider::new("alpha", &["alpha.example"])
            .with_series("Berserk", "a-1")
            .with_chapter(None, "1");
        let broken = ScriptedProvider::new("beta", &["beta.example"]).failing();
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(good)).unwrap();
        registry.register(Arc::new(broken)).unwrap();
        let ctx = context_with(registry);

        let key = seed_manga(&ctx, "alpha").await;
        ctx.reconciler
            .reconcile_manga(ProviderManga {
                manga: Manga::new("Berserk"),
                link: ProviderLink::new("beta", "b-1"),
            })
            .await
            .unwrap();

        // The broken provider is skipped, the good one's chapters land.
        CheckChaptersJob::new(key.clone(), None)
            .execute(&ctx)
            .await
            .unwrap();
        assert_eq!(ctx.reconciler.chapters(&key).await.len(), 1);
    }

    #[tokio::test]
    async fn test_check_chapters_unknown_manga_fails() {
        let ctx = context_with(ProviderRegistry::new());
        let result = CheckChaptersJob::new(MangaKey::from_title("ghost"), None)
            .execute(&ctx)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_download_new_chapters_marks_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/pages/\d+$"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"img"))
            .mount(&server)
            .await;

        let mut provider = ScriptedProvider::new("alpha", &["alpha.example"])
            .with_series("Berserk", "a-1")
            .with_chapter(None, "1");
        provider.image_urls = vec![format!("{}/pages/0", server.uri())];
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(provider)).unwrap();
        let ctx = context_with(registry);

        let key = seed_manga(&ctx, "alpha").await;
        CheckChaptersJob::new(key.clone(), None)
            .execute(&ctx)
            .await
            .unwrap();

        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(ChapterDownloader::new(
            Arc::clone(&ctx.fetch),
            Arc::new(FolderArchiveWriter::new(dir.path())),
        ));
        DownloadNewChaptersJob::new(key.clone(), downloader, Arc::new(PushSet::new()))
            .execute(&ctx)
            .await
            .unwrap();

        let chapters = ctx.reconciler.chapters(&key).await;
        assert!(chapters[0].downloaded);
        assert!(ctx.reconciler.new_chapters(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_metadata_updates_fields() {
        let provider = ScriptedProvider::new("alpha", &["alpha.example"])
            .with_series("Berserk", "a-1");
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(provider)).unwrap();
        let ctx = context_with(registry);

        let key = seed_manga(&ctx, "alpha").await;
        RefreshMetadataJob::new(key.clone(), None)
            .execute(&ctx)
            .await
            .unwrap();

        let manga = ctx.reconciler.manga(&key).await.unwrap();
        assert_eq!(manga.provider_ids.len(), 1);
    }
}
