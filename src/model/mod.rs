//! Canonical data model: provider-independent manga and chapter records.
//!
//! Providers return raw `(entity, link)` pairs; the reconciler merges them
//! into the canonical records defined here. Canonical identity is carried by
//! [`MangaKey`], a digest of the normalized primary title that is stable
//! across providers and never changes once assigned.

mod number;
mod ordering;

pub use number::ChapterNumber;
pub use ordering::{compare_chapters, new_chapters, sort_chapters};

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable, provider-independent identifier for a canonical manga.
///
/// Derived from the normalized primary title so that two providers listing
/// the same series under cosmetically different titles map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MangaKey(String);

impl MangaKey {
    /// Derives the canonical key from a title.
    ///
    /// Normalization lowercases and strips everything but alphanumerics
    /// before hashing, so "One-Punch Man" and "one punch man" collide.
    #[must_use]
    pub fn from_title(title: &str) -> Self {
        let normalized: String = title
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let digest = Sha256::digest(normalized.as_bytes());
        // 16 bytes of the digest is plenty for a local identity space.
        Self(format!("{digest:x}")[..32].to_string())
    }

    /// Returns the key as a hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MangaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rate-limiting bucket for a category of outbound request.
///
/// Orthogonal to provider: all metadata requests share one bucket no matter
/// which provider issues them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    /// Anything not covered by a more specific class.
    Default,
    /// Series metadata lookups (search, resolve).
    Metadata,
    /// Chapter feed listings.
    Feed,
    /// Cover image fetches.
    CoverImage,
    /// Chapter page image fetches.
    PageImage,
}

impl RequestClass {
    /// All request classes, for configuration iteration.
    pub const ALL: [Self; 5] = [
        Self::Default,
        Self::Metadata,
        Self::Feed,
        Self::CoverImage,
        Self::PageImage,
    ];

    /// Returns the configuration string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Metadata => "metadata",
            Self::Feed => "feed",
            Self::CoverImage => "cover_image",
            Self::PageImage => "page_image",
        }
    }
}

impl fmt::Display for RequestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "metadata" => Ok(Self::Metadata),
            "feed" => Ok(Self::Feed),
            "cover_image" => Ok(Self::CoverImage),
            "page_image" => Ok(Self::PageImage),
            _ => Err(format!("invalid request class: {s}")),
        }
    }
}

/// Publication status of a series, as a closed set of variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    /// Still releasing chapters.
    Continuing,
    /// Finished.
    Completed,
    /// Paused by the publisher.
    OnHiatus,
    /// Dropped by the publisher.
    Cancelled,
    /// Provider gave no usable status.
    #[default]
    Unknown,
}

/// The mapping from a canonical entity to one provider's identity for it.
///
/// `(provider, foreign_key)` is a unique composite per canonical entity:
/// at most one link per provider. `foreign_key` identifies the entity in
/// the provider's own namespace; `website_url` may be re-pointed on
/// re-fetch. `use_for_download` selects the authoritative link for chapter
/// image fetches when several providers carry the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLink {
    /// Name of the provider that produced this identity.
    pub provider: String,
    /// The entity's identifier in the provider's namespace.
    pub foreign_key: String,
    /// Display / re-derivation URL, when the provider exposes one.
    pub website_url: Option<String>,
    /// Whether this link is the one used to fetch chapter images.
    pub use_for_download: bool,
}

impl ProviderLink {
    /// Creates a link that is not (yet) the download source.
    #[must_use]
    pub fn new(provider: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            foreign_key: foreign_key.into(),
            website_url: None,
            use_for_download: false,
        }
    }

    /// Sets the display URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.website_url = Some(url.into());
        self
    }
}

/// Canonical, deduplicated manga record.
///
/// Owned by the reconciler: descriptive fields are only mutated through
/// merge operations, never partially overwritten by a single provider's
/// stale view. Multi-valued fields use ordered sets so that merges union
/// and never shrink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manga {
    /// Stable canonical identity.
    pub key: MangaKey,
    /// Primary display title.
    pub name: String,
    /// Long-form description.
    pub description: Option<String>,
    /// Cover image URL at the originating provider.
    pub cover_url: Option<String>,
    /// Publication status.
    pub status: ReleaseStatus,
    /// First publication year.
    pub year: Option<u16>,
    /// Chapters numbered at or below this value are never "new".
    pub ignore_chapters_before: f64,
    /// Author names, unioned across providers.
    pub authors: BTreeSet<String>,
    /// Genre/theme tags, unioned across providers.
    pub tags: BTreeSet<String>,
    /// Alternative titles, unioned across providers.
    pub alt_titles: BTreeSet<String>,
    /// External links (tracker pages etc.), unioned across providers.
    pub links: BTreeSet<String>,
    /// One link per provider that has produced this entity.
    pub provider_ids: Vec<ProviderLink>,
}

impl Manga {
    /// Creates a canonical record from a primary title, with the key derived
    /// from it.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: MangaKey::from_title(&name),
            name,
            description: None,
            cover_url: None,
            status: ReleaseStatus::Unknown,
            year: None,
            ignore_chapters_before: 0.0,
            authors: BTreeSet::new(),
            tags: BTreeSet::new(),
            alt_titles: BTreeSet::new(),
            links: BTreeSet::new(),
            provider_ids: Vec::new(),
        }
    }

    /// Returns the link flagged for downloads, if any.
    #[must_use]
    pub fn download_link(&self) -> Option<&ProviderLink> {
        self.provider_ids
            .iter()
            .find(|link| link.use_for_download)
            .or_else(|| self.provider_ids.first())
    }

    /// Returns the link for a provider by name.
    #[must_use]
    pub fn provider_link(&self, provider: &str) -> Option<&ProviderLink> {
        self.provider_ids
            .iter()
            .find(|link| link.provider == provider)
    }
}

/// A chapter of a canonical manga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    /// Key of the owning manga (non-owning back-reference).
    pub manga_key: MangaKey,
    /// Volume number, when the provider exposes one.
    pub volume: Option<i32>,
    /// Chapter number token; see [`ChapterNumber`].
    pub number: ChapterNumber,
    /// Chapter title, when present.
    pub title: Option<String>,
    /// Whether a local archive exists for this chapter.
    pub downloaded: bool,
    /// Archive file name once downloaded.
    pub file_name: Option<String>,
    /// One link per provider that has produced this chapter.
    pub provider_ids: Vec<ProviderLink>,
}

impl Chapter {
    /// Creates a chapter record for a manga.
    #[must_use]
    pub fn new(manga_key: MangaKey, number: impl Into<ChapterNumber>) -> Self {
        Self {
            manga_key,
            volume: None,
            number: number.into(),
            title: None,
            downloaded: false,
            file_name: None,
            provider_ids: Vec::new(),
        }
    }

    /// Sets the volume.
    #[must_use]
    pub fn with_volume(mut self, volume: i32) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Returns the link used to fetch this chapter's images.
    #[must_use]
    pub fn download_link(&self) -> Option<&ProviderLink> {
        self.provider_ids
            .iter()
            .find(|link| link.use_for_download)
            .or_else(|| self.provider_ids.first())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_manga_key_stable_across_title_cosmetics() {
        assert_eq!(
            MangaKey::from_title("One-Punch Man"),
            MangaKey::from_title("one punch man")
        );
        assert_ne!(
            MangaKey::from_title("One-Punch Man"),
            MangaKey::from_title("Mob Psycho 100")
        );
    }

    #[test]
    fn test_manga_key_is_hex_and_fixed_width() {
        let key = MangaKey::from_title("Berserk");
        assert_eq!(key.as_str().len(), 32);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_request_class_round_trip() {
        for class in RequestClass::ALL {
            let parsed: RequestClass = class.as_str().parse().unwrap();
            assert_eq!(parsed, class);
        }
        assert!("bogus".parse::<RequestClass>().is_err());
    }

    #[test]
    fn test_download_link_prefers_flagged() {
        let mut manga = Manga::new("Berserk");
        manga.provider_ids.push(ProviderLink::new("alpha", "a-1"));
        let mut flagged = ProviderLink::new("beta", "b-1");
        flagged.use_for_download = true;
        manga.provider_ids.push(flagged);

        assert_eq!(manga.download_link().unwrap().provider, "beta");
    }

    #[test]
    fn test_download_link_falls_back_to_first() {
        let mut manga = Manga::new("Berserk");
        manga.provider_ids.push(ProviderLink::new("alpha", "a-1"));
        manga.provider_ids.push(ProviderLink::new("beta", "b-1"));

        assert_eq!(manga.download_link().unwrap().provider, "alpha");
    }
}
