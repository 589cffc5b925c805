use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

/// Get current Unix timestamp in seconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn word_regex() -> &'static Regex {
    static WORDS: OnceLock<Regex> = OnceLock::new();
    WORDS.get_or_init(|| Regex::new(r"[\p{L}\p{N}]+").expect("static regex is valid"))
}

/// Keep only the alphanumeric runs of `part`, joined by `-`.
pub fn sanitize_filename(part: &str) -> String {
    word_regex()
        .find_iter(part)
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join("-")
}

/// Build a file stem from a human-readable title and artist.
///
/// Path separators, dots and every other non-alphanumeric character are
/// dropped, so the result can never escape the storage directory.
pub fn resolve_file_name(title: &str, artist: Option<&str>) -> String {
    let parts: Vec<String> = std::iter::once(title)
        .chain(artist)
        .map(sanitize_filename)
        .filter(|p| !p.is_empty())
        .collect();

    if parts.is_empty() {
        "track".to_string()
    } else {
        parts.join("-")
    }
}
