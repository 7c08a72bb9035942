//! Chapter download orchestration: image fetch, archive hand-off, state
//! update.
//!
//! The downloader picks the chapter's download-flagged provider link, fetches
//! each page image under the `page_image` request class, and hands the
//! ordered bytes to the archive-writer collaborator. Cancellation is checked
//! before every image, so a stopped download ends between pages without
//! corrupting already-written output.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::fetch::{FetchClient, FetchError};
use crate::model::{Chapter, Manga, RequestClass};
use crate::provider::{ProviderError, ProviderRegistry};

/// Errors from an archive-writer collaborator.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Writing the archive to disk failed.
    #[error("IO error writing archive {name}: {source}")]
    Io {
        /// Archive file name.
        name: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl ArchiveError {
    /// Creates an IO archive error.
    pub fn io(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            name: name.into(),
            source,
        }
    }
}

/// Archive collaborator: turns ordered image bytes into a chapter archive
/// and answers whether one already exists locally.
#[async_trait]
pub trait ArchiveWriter: Send + Sync + std::fmt::Debug {
    /// True when a local archive for this chapter already exists (probed by
    /// the writer's own naming convention).
    fn is_archived(&self, manga: &Manga, chapter: &Chapter) -> bool;

    /// Writes the archive; returns the archive file name.
    async fn write(
        &self,
        manga: &Manga,
        chapter: &Chapter,
        images: Vec<Vec<u8>>,
    ) -> Result<String, ArchiveError>;
}

/// Errors from a chapter download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The chapter has no provider link to download from.
    #[error("chapter {number} has no provider link to download from")]
    NoDownloadLink {
        /// The chapter number.
        number: String,
    },

    /// Listing image URLs failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Fetching an image failed after retries.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Writing the archive failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Outcome of one chapter download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// All images fetched and archived.
    Completed {
        /// Archive file name reported by the writer.
        file_name: String,
    },
    /// An archive already existed; nothing was fetched.
    AlreadyArchived,
    /// Cancellation stopped the download between images.
    Cancelled,
}

/// Downloads chapters image-by-image through the rate-limited fetch client.
#[derive(Debug)]
pub struct ChapterDownloader {
    fetch: Arc<FetchClient>,
    archive: Arc<dyn ArchiveWriter>,
}

impl ChapterDownloader {
    /// Creates a downloader over the shared fetch client and archive writer.
    #[must_use]
    pub fn new(fetch: Arc<FetchClient>, archive: Arc<dyn ArchiveWriter>) -> Self {
        Self { fetch, archive }
    }

    /// Downloads one chapter.
    ///
    /// The provider is resolved from the chapter's download-flagged link;
    /// the link's website URL is passed as the referer for image fetches
    /// (some CDNs refuse bare requests). Cancellation is honored between
    /// images.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when the chapter has no link, the provider
    /// call fails, an image fetch exhausts its retries, or archiving fails.
    #[instrument(skip(self, providers, manga, chapter, cancel), fields(key = %manga.key, number = %chapter.number))]
    pub async fn download(
        &self,
        providers: &ProviderRegistry,
        manga: &Manga,
        chapter: &Chapter,
        cancel: &AtomicBool,
    ) -> Result<DownloadOutcome, DownloadError> {
        if self.archive.is_archived(manga, chapter) {
            debug!("archive already present; skipping");
            return Ok(DownloadOutcome::AlreadyArchived);
        }

        let link = chapter
            .download_link()
            .ok_or_else(|| DownloadError::NoDownloadLink {
                number: chapter.number.as_str().to_string(),
            })?;
        let provider = providers.require(&link.provider)?;
        let image_urls = provider.chapter_image_urls(link).await?;
        debug!(images = image_urls.len(), provider = %link.provider, "downloading chapter images");

        let referer = link.website_url.as_deref();
        let mut images = Vec::with_capacity(image_urls.len());
        for (index, url) in image_urls.iter().enumerate() {
            // Stop between images: already-fetched pages stay intact, the
            // archive is simply never written.
            if cancel.load(Ordering::SeqCst) {
                warn!(fetched = index, total = image_urls.len(), "chapter download cancelled");
                return Ok(DownloadOutcome::Cancelled);
            }
            let response = self
                .fetch
                .fetch_with(url, RequestClass::PageImage, referer, Some(cancel))
                .await?;
            images.push(response.body);
        }

        let file_name = self.archive.write(manga, chapter, images).await?;
        info!(file_name = %file_name, "chapter archived");
        Ok(DownloadOutcome::Completed { file_name })
    }
}

/// Folder-per-series archive writer: one directory per manga, one archive
/// file per chapter with the images concatenated page order preserved by
/// file naming inside a per-chapter directory.
///
/// Enough for the default daemon and for exercising the seam; richer
/// formats (CBZ with ComicInfo metadata) live in external collaborators.
#[derive(Debug)]
pub struct FolderArchiveWriter {
    root: std::path::PathBuf,
}

impl FolderArchiveWriter {
    /// Creates a writer rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn chapter_dir_name(chapter: &Chapter) -> String {
        match chapter.volume {
            Some(volume) => format!("Vol.{volume} Ch.{}", chapter.number),
            None => format!("Ch.{}", chapter.number),
        }
    }

    fn chapter_dir(&self, manga: &Manga, chapter: &Chapter) -> std::path::PathBuf {
        self.root
            .join(sanitize(&manga.name))
            .join(Self::chapter_dir_name(chapter))
    }
}

/// Strips path-hostile characters from a series name.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
            '_'
        } else {
            c
        })
        .collect()
}

#[async_trait]
impl ArchiveWriter for FolderArchiveWriter {
    fn is_archived(&self, manga: &Manga, chapter: &Chapter) -> bool {
        self.chapter_dir(manga, chapter).is_dir()
    }

    async fn write(
        &self,
        manga: &Manga,
        chapter: &Chapter,
        images: Vec<Vec<u8>>,
    ) -> Result<String, ArchiveError> {
        let dir = self.chapter_dir(manga, chapter);
        let name = Self::chapter_dir_name(chapter);

        // Stage into a temp dir, then rename: a cancelled or failed write
        // never leaves a half-populated chapter dir behind.
        let staging = dir.with_extension("partial");
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| ArchiveError::io(&name, e))?;
        for (index, image) in images.iter().enumerate() {
            let page = staging.join(format!("{:04}.img", index + 1));
            tokio::fs::write(&page, image)
                .await
                .map_err(|e| ArchiveError::io(&name, e))?;
        }
        tokio::fs::rename(&staging, &dir)
            .await
            .map_err(|e| ArchiveError::io(&name, e))?;
        Ok(name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fetch::{FetchClient, HttpTransport, RateLimit, RateLimiter, RetryPolicy};
    use crate::provider::ProviderRegistry;
    use crate::provider::test_support::ScriptedProvider;
    use crate::model::{MangaKey, ProviderLink};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetch_client() -> Arc<FetchClient> {
        Arc::new(FetchClient::new(
            Arc::new(HttpTransport::new()),
            Arc::new(RateLimiter::new(RateLimit::new(100, Duration::from_millis(10)))),
            RetryPolicy::with_max_attempts(1),
        ))
    }

    fn chapter_with_link(provider: &str) -> Chapter {
        let mut chapter = Chapter::new(MangaKey::from_title("Berserk"), "1");
        let mut link = ProviderLink::new(provider, "ch-1");
        link.use_for_download = true;
        chapter.provider_ids.push(link);
        chapter
    }

    async fn image_server(pages: usize) -> (MockServer, Vec<String>) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/pages/\d+$"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"image-bytes"))
            .mount(&server)
            .await;
        let urls = (0..pages)
            .map(|i| format!("{}/pages/{i}", server.uri()))
            .collect();
        (server, urls)
    }

    #[tokio::test]
    async fn test_download_writes_archive_and_reports_name() {
        let (_server, urls) = image_server(3).await;
        let mut provider = ScriptedProvider::new("alpha", &["alpha.example"]);
        provider.image_urls = urls;
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(provider)).unwrap();

        let dir = TempDir::new().unwrap();
        let downloader = ChapterDownloader::new(
            fetch_client(),
            Arc::new(FolderArchiveWriter::new(dir.path())),
        );

        let manga = Manga::new("Berserk");
        let chapter = chapter_with_link("alpha");
        let cancel = AtomicBool::new(false);

        let outcome = downloader
            .download(&registry, &manga, &chapter, &cancel)
            .await
            .unwrap();
        let DownloadOutcome::Completed { file_name } = outcome else {
            panic!("expected Completed, got {outcome:?}");
        };
        assert_eq!(file_name, "Ch.1");

        let pages: Vec<_> = std::fs::read_dir(dir.path().join("Berserk").join("Ch.1"))
            .unwrap()
            .collect();
        assert_eq!(pages.len(), 3);
    }

    #[tokio::test]
    async fn test_existing_archive_skips_fetch() {
        let mut provider = ScriptedProvider::new("alpha", &["alpha.example"]);
        provider.image_urls = vec!["https://unused.example/1".to_string()];
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(provider)).unwrap();

        let dir = TempDir::new().unwrap();
        let manga = Manga::new("Berserk");
        let chapter = chapter_with_link("alpha");
        std::fs::create_dir_all(dir.path().join("Berserk").join("Ch.1")).unwrap();

        let downloader = ChapterDownloader::new(
            fetch_client(),
            Arc::new(FolderArchiveWriter::new(dir.path())),
        );
        let outcome = downloader
            .download(&registry, &manga, &chapter, &AtomicBool::new(false))
            .await
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::AlreadyArchived);
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_images() {
        let (_server, urls) = image_server(5).await;
        let mut provider = ScriptedProvider::new("alpha", &["alpha.example"]);
        provider.image_urls = urls;
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(provider)).unwrap();

        let dir = TempDir::new().unwrap();
        let downloader = ChapterDownloader::new(
            fetch_client(),
            Arc::new(FolderArchiveWriter::new(dir.path())),
        );

        let manga = Manga::new("Berserk");
        let chapter = chapter_with_link("alpha");
        let cancel = AtomicBool::new(true);

        let outcome = downloader
            .download(&registry, &manga, &chapter, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Cancelled);

        // No archive dir was produced.
        assert!(!dir.path().join("Berserk").join("Ch.1").exists());
    }

    #[tokio::test]
    async fn test_chapter_without_link_errors() {
        let registry = ProviderRegistry::new();
        let dir = TempDir::new().unwrap();
        let downloader = ChapterDownloader::new(
            fetch_client(),
            Arc::new(FolderArchiveWriter::new(dir.path())),
        );

        let manga = Manga::new("Berserk");
        let chapter = Chapter::new(manga.key.clone(), "1");
        let result = downloader
            .download(&registry, &manga, &chapter, &AtomicBool::new(false))
            .await;
        assert!(matches!(result, Err(DownloadError::NoDownloadLink { .. })));
    }

    #[test]
    fn test_sanitize_strips_path_separators() {
        assert_eq!(sanitize("Fate/stay night"), "Fate_stay night");
        assert_eq!(sanitize(r#"Re: Zero?"#), "Re_ Zero_");
    }
}
