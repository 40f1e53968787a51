//! Account-tag pattern matching for C3: `*suffix`, `prefix*`,
//! `*substring*`, and exact, with a specificity score for
//! most-specific-match-wins resolution.

/// Supported forms: `*suffix`, `prefix*`, `*substring*`, and exact (no `*`).
pub fn matches(pattern: &str, tag: &str) -> bool {
    if let Some(inner) = pattern
        .strip_prefix('*')
        .and_then(|s| s.strip_suffix('*'))
        .filter(|_| pattern.len() >= 2)
    {
        return tag.contains(inner);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return tag.len() >= suffix.len() && tag.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return tag.len() >= prefix.len() && tag.starts_with(prefix);
    }
    tag == pattern
}

/// "Longest non-wildcard prefix": the literal run of characters before the
/// first `*`, or the whole pattern when there is no wildcard. A plain
/// `prefix*` or exact pattern scores by its full literal length; a
/// `*suffix` or `*substring*` pattern scores 0 and only wins via the
/// lexicographic tie-break.
pub fn specificity(pattern: &str) -> usize {
    pattern.split('*').next().unwrap_or("").len()
}

/// Find the most specific pattern matching `tag` among `patterns`.
/// Ties broken lexicographically (smaller string wins), matching the
/// deterministic-but-arbitrary tie-break documented in DESIGN.md.
pub fn best_match<'a>(tag: &str, patterns: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    patterns
        .filter(|p| matches(p, tag))
        .max_by(|a, b| {
            specificity(a)
                .cmp(&specificity(b))
                .then_with(|| b.cmp(a)) // smaller string wins ties
        })
}
