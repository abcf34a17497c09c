// src/text.rs
// Shared text normalization used by hashing, local dedup, and consolidation.

/// Normalize a string for comparison/hashing purposes: lowercase, collapse
/// every run of non-alphanumeric characters to a single space, trim.
///
/// Idempotent: `normalize(normalize(s)) == normalize(s)` for all `s`.
pub fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for ch in s.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim().to_string()
}

/// Whitespace-collapsed rendering used by the chunker: collapse all runs of
/// whitespace to single spaces but keep casing and punctuation intact.
pub fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

/// Word trigrams (character shingles over whitespace-split tokens) of a
/// normalized string, used for Jaccard similarity in local dedup and the
/// consolidator's near-exact-duplicate pass.
pub fn trigrams(normalized: &str) -> std::collections::HashSet<String> {
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    let mut grams = std::collections::HashSet::new();
    if tokens.len() < 3 {
        if !tokens.is_empty() {
            grams.insert(tokens.join(" "));
        }
        return grams;
    }
    for w in tokens.windows(3) {
        grams.insert(w.join(" "));
    }
    grams
}

/// Jaccard similarity between two trigram sets, in [0, 1].
pub fn jaccard(a: &std::collections::HashSet<String>, b: &std::collections::HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let s = "  Hello, World!!  Foo-Bar_Baz  ";
        let once = normalize(s);
        let twice = normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_collapses_punctuation() {
        assert_eq!(normalize("foo, bar! baz?"), "foo bar baz");
    }

    #[test]
    fn normalize_lowercases() {
        assert_eq!(normalize("FOO Bar"), "foo bar");
    }

    #[test]
    fn jaccard_identical_sets_is_one() {
        let a = trigrams(&normalize("the quick brown fox jumps"));
        assert!((jaccard(&a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn jaccard_disjoint_sets_is_zero() {
        let a = trigrams(&normalize("completely unrelated sentence here"));
        let b = trigrams(&normalize("totally different words entirely"));
        assert_eq!(jaccard(&a, &b), 0.0);
    }

    #[test]
    fn jaccard_near_duplicate_is_high() {
        let a = trigrams(&normalize(
            "the deployment pipeline now runs integration tests before release",
        ));
        let b = trigrams(&normalize(
            "the deployment pipeline now runs integration tests before shipping",
        ));
        let sim = jaccard(&a, &b);
        assert!(sim >= 0.85, "expected >= 0.85, got {sim}");
    }

    #[test]
    fn collapse_whitespace_preserves_case_and_punctuation() {
        assert_eq!(
            collapse_whitespace("Hello,\n\n  World!\t"),
            "Hello, World!"
        );
    }
}
