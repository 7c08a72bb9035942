//! Local cover-image cache.
//!
//! Covers are fetched at most once per manga: a single global lock
//! serializes the check-exists → fetch → write sequence so concurrent
//! refreshes of the same series never download the same image twice.
//! Fetch failures are retried a bounded number of times; after that the
//! manga simply has no cover until the next refresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::fetch::FetchClient;
use crate::model::{Manga, RequestClass};

/// Default bound on fetch attempts per cover.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Cache of cover images on local disk, keyed by canonical manga key.
#[derive(Debug)]
pub struct CoverCache {
    dir: PathBuf,
    fetch: Arc<FetchClient>,
    max_attempts: u32,
    /// Guards check-exists → fetch → write as one critical section.
    guard: Mutex<()>,
}

impl CoverCache {
    /// Creates a cache rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, fetch: Arc<FetchClient>) -> Self {
        Self {
            dir: dir.into(),
            fetch,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            guard: Mutex::new(()),
        }
    }

    /// Overrides the retry bound.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Returns the cached cover path for a manga, fetching it on a miss.
    ///
    /// Returns `None` when the manga has no cover URL or every fetch
    /// attempt failed — "no cover" is a normal outcome, not an error.
    #[instrument(skip(self, manga), fields(key = %manga.key))]
    pub async fn get_or_fetch(&self, manga: &Manga) -> Option<PathBuf> {
        let url = manga.cover_url.as_deref()?;
        let path = self.cover_path(manga, url);

        let _guard = self.guard.lock().await;
        if path.exists() {
            debug!(path = %path.display(), "cover already cached");
            return Some(path);
        }

        // Bounded retry, explicit loop, terminal "no cover" on exhaustion.
        for attempt in 1..=self.max_attempts {
            match self.fetch.fetch(url, RequestClass::CoverImage).await {
                Ok(response) => {
                    if let Err(error) = self.write_cover(&path, &response.body).await {
                        warn!(path = %path.display(), error = %error, "failed to write cover");
                        return None;
                    }
                    debug!(path = %path.display(), bytes = response.body.len(), "cover cached");
                    return Some(path);
                }
                Err(error) => {
                    warn!(
                        url,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "cover fetch attempt failed"
                    );
                }
            }
        }

        warn!(url, "giving up on cover after {} attempts", self.max_attempts);
        None
    }

    async fn write_cover(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(path, bytes).await
    }

    fn cover_path(&self, manga: &Manga, url: &str) -> PathBuf {
        let extension = url
            .rsplit('.')
            .next()
            .filter(|ext| matches!(*ext, "jpg" | "jpeg" | "png" | "webp" | "gif"))
            .unwrap_or("jpg");
        self.dir.join(format!("{}.{extension}", manga.key))
    }
}
