//! String-preserving chapter numbers.
//!
//! Providers emit chapter numbers as free text ("10", "10.5", "Ch. 4",
//! "extra.1"). The raw string is preserved for display and archive naming,
//! while ordering and cutoff decisions use the parsed numeric value. Parsing
//! is culture-invariant: `.` is always the decimal separator, regardless of
//! the host locale.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A chapter number as emitted by a provider.
///
/// The raw token is kept verbatim; [`ChapterNumber::value`] extracts the
/// numeric value when one exists. Numbers without a parseable numeric token
/// are representable but excluded from ordering and new-chapter detection.
///
/// # Example
///
/// ```
/// use mangasync_core::model::ChapterNumber;
///
/// assert_eq!(ChapterNumber::new("10.5").value(), Some(10.5));
/// assert_eq!(ChapterNumber::new("Ch. 4").value(), Some(4.0));
/// assert_eq!(ChapterNumber::new("oneshot").value(), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChapterNumber(String);

/// Matches the trailing decimal token in a free-text chapter label.
#[allow(clippy::expect_used)]
static NUMERIC_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*$").expect("chapter number regex is valid")
});

impl ChapterNumber {
    /// Wraps a raw provider-emitted chapter number token.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    /// Returns the raw token as emitted by the provider.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the numeric value of this chapter number.
    ///
    /// Tries the whole token first ("10.5"), then falls back to the trailing
    /// numeric token of a free-text label ("extra.1" → 1.0, "Ch. 10.5" →
    /// 10.5). Returns `None` when no numeric token is present; such chapters
    /// are excluded from ordering and cutoff decisions.
    ///
    /// `str::parse::<f64>` always uses `.` as the decimal separator, so the
    /// result does not depend on the host locale.
    #[must_use]
    pub fn value(&self) -> Option<f64> {
        if let Ok(value) = self.0.parse::<f64>() {
            return value.is_finite().then_some(value);
        }
        NUMERIC_TOKEN
            .captures(&self.0)
            .and_then(|caps| caps.get(1))
            .and_then(|token| token.as_str().parse::<f64>().ok())
    }

    /// Returns true when the number carries a parseable numeric token.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        self.value().is_some()
    }
}

impl fmt::Display for ChapterNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChapterNumber {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for ChapterNumber {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}
