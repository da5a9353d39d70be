//! String similarity scoring shared by header alignment and identity matching.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z0-9%]+").unwrap());

pub fn tokens(value: &str) -> HashSet<String> {
    TOKEN_RE
        .find_iter(value)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Normalized Levenshtein similarity in `[0, 1]`.
pub fn edit_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    strsim::normalized_levenshtein(a, b)
}

/// Dice coefficient over lowercase alphanumeric token sets.
pub fn token_dice(a: &str, b: &str) -> f64 {
    let left = tokens(a);
    let right = tokens(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let overlap = left.intersection(&right).count();
    (2 * overlap) as f64 / (left.len() + right.len()) as f64
}

/// Score used for fuzzy name matching: the better of character-level and
/// token-level agreement, so both typos and reordered words score well.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    edit_similarity(a, b).max(token_dice(a, b))
}
