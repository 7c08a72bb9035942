//! Total order over chapters and the new-chapter cutoff filter.
//!
//! Chapters sort by `(volume, number)`: volume first (missing volumes after
//! numbered ones), then the parsed numeric value of the chapter number.
//! Chapters whose number has no numeric value cannot be ordered; they are
//! excluded from sorting and from new-chapter detection, logged, never fatal.

use std::cmp::Ordering;

use tracing::warn;

use super::{Chapter, Manga};

/// Compares two chapters by `(volume, number)`.
///
/// Both chapters must have numeric numbers; callers are expected to have
/// filtered unorderable chapters out (see [`sort_chapters`]). A missing
/// numeric value sorts last as a safety net.
///
/// Volume policy: `Some` sorts before `None`, so chapters without volume
/// information land after the numbered volume run.
#[must_use]
pub fn compare_chapters(a: &Chapter, b: &Chapter) -> Ordering {
    match (a.volume, b.volume) {
        (Some(va), Some(vb)) if va != vb => return va.cmp(&vb),
        (Some(_), None) => return Ordering::Less,
        (None, Some(_)) => return Ordering::Greater,
        _ => {}
    }
    match (a.number.value(), b.number.value()) {
        (Some(na), Some(nb)) => na.partial_cmp(&nb).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Sorts chapters into reading order, splitting off the unorderable ones.
///
/// Returns `(ordered, skipped)`: `ordered` is ascending by
/// `(volume, number)`; `skipped` holds chapters whose number carries no
/// numeric token. Skipped chapters are logged once per call.
#[must_use]
pub fn sort_chapters(chapters: Vec<Chapter>) -> (Vec<Chapter>, Vec<Chapter>) {
    let (mut ordered, skipped): (Vec<_>, Vec<_>) = chapters
        .into_iter()
        .partition(|chapter| chapter.number.is_numeric());
    ordered.sort_by(compare_chapters);

    if !skipped.is_empty() {
        warn!(
            skipped = skipped.len(),
            numbers = ?skipped.iter().map(|c| c.number.as_str()).collect::<Vec<_>>(),
            "excluding chapters with non-numeric numbers from ordering"
        );
    }
    (ordered, skipped)
}

/// Filters chapters down to the ones eligible for download.
///
/// A chapter is "new" iff its parsed number is strictly greater than the
/// manga's `ignore_chapters_before` cutoff and it is not already marked
/// downloaded. Chapters without a numeric number are never new. The result
/// is in reading order.
#[must_use]
pub fn new_chapters(manga: &Manga, chapters: &[Chapter]) -> Vec<Chapter> {
    let eligible: Vec<Chapter> = chapters
        .iter()
        .filter(|chapter| !chapter.downloaded)
        .filter(|chapter| {
            chapter
                .number
                .value()
                .is_some_and(|n| n > manga.ignore_chapters_before)
        })
        .cloned()
        .collect();
    let (ordered, _skipped) = sort_chapters(eligible);
    ordered
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::MangaKey;

    fn chapter(volume: Option<i32>, number: &str) -> Chapter {
        let mut c = Chapter::new(MangaKey::from_title("test"), number);
        c.volume = volume;
        c
    }

    #[test]
    fn test_sort_is_numeric_not_lexicographic() {
        // "9.5" < "10" numerically even though "10" < "9.5" as strings.
        let (ordered, skipped) = sort_chapters(vec![
            chapter(Some(1), "10"),
            chapter(Some(1), "9.5"),
            chapter(None, "1"),
        ]);
        assert!(skipped.is_empty());
        let numbers: Vec<&str> = ordered.iter().map(|c| c.number.as_str()).collect();
        // Volume policy: Some before None, so the volumeless "1" sorts last.
        assert_eq!(numbers, vec!["9.5", "10", "1"]);
    }

    #[test]
    fn test_volume_is_primary_key() {
        let (ordered, _) = sort_chapters(vec![
            chapter(Some(2), "1"),
            chapter(Some(1), "99"),
        ]);
        let volumes: Vec<Option<i32>> = ordered.iter().map(|c| c.volume).collect();
        assert_eq!(volumes, vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_unparseable_numbers_are_split_off() {
        let (ordered, skipped) = sort_chapters(vec![
            chapter(Some(1), "2"),
            chapter(Some(1), "oneshot"),
            chapter(Some(1), "1"),
        ]);
        assert_eq!(ordered.len(), 2);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].number.as_str(), "oneshot");
    }

    #[test]
    fn test_cutoff_is_strict() {
        let mut manga = crate::model::Manga::new("test");
        manga.ignore_chapters_before = 5.0;
        let chapters = vec![chapter(None, "5"), chapter(None, "5.1"), chapter(None, "4")];

        let fresh = new_chapters(&manga, &chapters);
        let numbers: Vec<&str> = fresh.iter().map(|c| c.number.as_str()).collect();
        assert_eq!(numbers, vec!["5.1"]);
    }

    #[test]
    fn test_downloaded_chapters_are_not_new() {
        let manga = crate::model::Manga::new("test");
        let mut done = chapter(None, "3");
        done.downloaded = true;
        let fresh = new_chapters(&manga, &[done, chapter(None, "4")]);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].number.as_str(), "4");
    }

    #[test]
    fn test_non_numeric_never_new() {
        let manga = crate::model::Manga::new("test");
        let fresh = new_chapters(&manga, &[chapter(None, "extra")]);
        assert!(fresh.is_empty());
    }
}
