use unicode_normalization::UnicodeNormalization;

/// Canonical lookup key for a free-text institution name.
///
/// Applies NFKC, trims, collapses internal whitespace, and casefolds. Returns `None` for
/// names that are empty after cleanup.
pub fn normalize_entity_key(name: &str) -> Option<String> {
    let composed: String = name.nfkc().collect();
    let key = composed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

/// Display form sent to the inference API: trimmed, internal whitespace collapsed.
pub fn display_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}
