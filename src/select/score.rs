//! Text normalization and similarity scoring for candidate selection.
//!
//! Titles and creators are normalized (Unicode NFKD with combining marks
//! stripped, lowercased, punctuation collapsed to whitespace) before a
//! token-set similarity ratio in 0..100 is computed. Folding diacritics
//! before comparison keeps "Café" and "Cafe" equal.

use std::collections::BTreeSet;

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Normalizes a string for comparison: diacritic folding, lowercase,
/// punctuation to whitespace, collapsed whitespace.
#[must_use]
pub fn normalize(text: &str) -> String {
    let folded: String = text
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();

    let mut out = String::with_capacity(folded.len());
    let mut pending_space = false;
    for c in folded.chars() {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        } else {
            pending_space = true;
        }
    }
    out
}

/// Token-set similarity ratio between two strings, in 0..100.
///
/// Both inputs are normalized, split into unique token sets, and compared
/// via the maximum pairwise similarity of the sorted intersection and
/// difference strings. Word order and duplicate tokens do not matter.
#[must_use]
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let tokens_a: BTreeSet<String> = normalize(a).split_whitespace().map(str::to_string).collect();
    let tokens_b: BTreeSet<String> = normalize(b).split_whitespace().map(str::to_string).collect();

    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 100.0;
    }
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let intersection: Vec<&str> = tokens_a.intersection(&tokens_b).map(String::as_str).collect();
    let only_a: Vec<&str> = tokens_a.difference(&tokens_b).map(String::as_str).collect();
    let only_b: Vec<&str> = tokens_b.difference(&tokens_a).map(String::as_str).collect();

    let base = intersection.join(" ");
    let combined_a = join_parts(&base, &only_a);
    let combined_b = join_parts(&base, &only_b);

    let r1 = similarity(&base, &combined_a);
    let r2 = similarity(&base, &combined_b);
    let r3 = similarity(&combined_a, &combined_b);
    (r1.max(r2).max(r3) * 100.0).clamp(0.0, 100.0)
}

fn join_parts(base: &str, rest: &[&str]) -> String {
    if rest.is_empty() {
        base.to_string()
    } else if base.is_empty() {
        rest.join(" ")
    } else {
        format!("{base} {}", rest.join(" "))
    }
}

fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        // Both strings reduce to nothing; defer to the other pairings.
        return 0.0;
    }
    strsim::normalized_levenshtein(a, b)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_basic() {
        assert_eq!(normalize("The Raven"), "the raven");
        assert_eq!(normalize("  The   Raven!  "), "the raven");
        assert_eq!(normalize("L'Étranger"), "l etranger");
    }

    #[test]
    fn test_normalize_folds_diacritics() {
        assert_eq!(normalize("Café"), "cafe");
        assert_eq!(normalize("Über die Hypothesen"), "uber die hypothesen");
    }

    #[test]
    fn test_identical_titles_score_100() {
        assert!((token_set_ratio("The Raven", "The Raven") - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_case_and_punctuation_insensitive() {
        assert!((token_set_ratio("The Raven", "the raven!") - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_word_order_insensitive() {
        assert!((token_set_ratio("Raven The", "The Raven") - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_subset_scores_high() {
        // One title extends the other; the intersection-vs-superset pairing
        // keeps the score well above unrelated pairs.
        let score = token_set_ratio("The Raven", "The Raven and Other Poems");
        assert!(score > 50.0, "got {score}");
    }

    #[test]
    fn test_unrelated_titles_score_low() {
        let score = token_set_ratio("The Raven", "ZZZZ unknown");
        assert!(score < 40.0, "got {score}");
    }

    #[test]
    fn test_diacritics_fold_in_comparison() {
        assert!((token_set_ratio("Café", "Cafe") - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_inputs() {
        assert!((token_set_ratio("", "") - 100.0).abs() < f64::EPSILON);
        assert!(token_set_ratio("The Raven", "").abs() < f64::EPSILON);
    }
}
