//! Text similarity for context nodes
//!
//! Deliberately cheap: lowercase word sets with short words and stopwords
//! removed, compared with Jaccard overlap, plus a bonus for sharing a
//! context type.

use std::collections::BTreeSet;

/// Share of the score carried by token overlap
const TOKEN_WEIGHT: f64 = 0.7;
/// Share of the score carried by a matching context type
const TYPE_WEIGHT: f64 = 0.3;
/// Words shorter than this are ignored
const MIN_TOKEN_LEN: usize = 3;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "him", "his", "how", "its", "may", "new", "now", "see", "two",
    "who", "did", "get", "let", "say", "she", "too", "use", "this", "that", "with", "have",
    "from", "they", "will", "would", "there", "their", "what", "about", "which", "when", "make",
    "like", "into", "than", "them", "then", "some", "could", "these", "those", "been", "were",
    "your", "please",
];

/// Significant lowercase words of `text`
#[must_use]
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_TOKEN_LEN && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// |a ∩ b| / |a ∪ b|, or 0 when both are empty
#[must_use]
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Similarity of two nodes in [0, 1]
#[must_use]
pub fn similarity(
    a_tokens: &BTreeSet<String>,
    a_type: Option<&str>,
    b_tokens: &BTreeSet<String>,
    b_type: Option<&str>,
) -> f64 {
    let same_type = matches!((a_type, b_type), (Some(x), Some(y)) if x.eq_ignore_ascii_case(y));
    TOKEN_WEIGHT * jaccard(a_tokens, b_tokens) + if same_type { TYPE_WEIGHT } else { 0.0 }
}
