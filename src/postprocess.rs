//! Cleanup applied to assistant replies before they are stored.

use once_cell::sync::Lazy;
use regex::Regex;

/// Inline file-search citation, e.g. `【3:1†source】`.
static CITATION_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"【[0-9]+:[0-9]+†source】").expect("citation pattern is valid"));

/// Remove every citation marker from `text`.
///
/// Removal is repeated until nothing matches, so markers that only become
/// contiguous after an inner one is removed are stripped too and the
/// function is idempotent.
pub fn clean(text: &str) -> String {
    let mut current = text.to_string();
    while CITATION_MARKER.is_match(&current) {
        current = CITATION_MARKER.replace_all(&current, "").into_owned();
    }
    current
}
