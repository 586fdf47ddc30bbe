//! Domain subscription patterns.
//!
//! A pattern is an exact lowercase domain, a single-level wildcard
//! `*.suffix`, or the bare [`GLOBAL_PATTERN`] meaning every domain.

use std::collections::BTreeSet;

use tracing::warn;

/// Subscribes to every domain.
pub const GLOBAL_PATTERN: &str = "*";

/// Wildcard rule: `pattern` is `*.suffix`, `domain` ends with `.suffix` and
/// is strictly longer than it. The bare `*` is not handled here.
pub fn matches_wildcard(pattern: &str, domain: &str) -> bool {
    let Some(suffix) = pattern.strip_prefix('*') else {
        return false;
    };
    if !suffix.starts_with('.') {
        return false;
    }
    domain.len() > suffix.len() && domain.ends_with(suffix)
}

/// Exact, wildcard or global match.
pub fn matches(pattern: &str, domain: &str) -> bool {
    pattern == GLOBAL_PATTERN || pattern == domain || matches_wildcard(pattern, domain)
}

/// True for `*.suffix` wildcards (not the bare `*`).
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.starts_with("*.")
}

/// Check a single, already normalised pattern.
pub fn is_valid(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    if pattern == GLOBAL_PATTERN {
        return true;
    }

    let name = pattern.strip_prefix("*.").unwrap_or(pattern);
    if name.is_empty() || name.contains('*') {
        return false;
    }
    if name.contains('/') || name.contains('\\') || name.chars().any(char::is_whitespace) {
        return false;
    }
    name.split('.').all(|label| !label.is_empty())
}

/// Trim, lowercase and de-duplicate a requested pattern list. Malformed
/// entries such as `*.`, `a.*.com` or `**.com` are dropped with a warning.
pub fn normalize_patterns<I, S>(patterns: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = BTreeSet::new();
    for raw in patterns {
        let pattern = raw.as_ref().trim().to_ascii_lowercase();
        if pattern.is_empty() {
            continue;
        }
        if !is_valid(&pattern) {
            warn!(pattern = %pattern, "Ignoring malformed domain pattern");
            continue;
        }
        out.insert(pattern);
    }
    out
}
