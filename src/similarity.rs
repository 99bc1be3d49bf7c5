//! # Stage: Similarity Scorer
//!
//! ## Responsibility
//! Cheap text-level similarity between failure descriptions and pattern
//! keywords. Two primitives: a normalized similarity score in [0,1]
//! combining edit distance with term overlap, and a fuzzy keyword match
//! that consults a small synonym-expansion table ("port" also matches
//! "socket", "address", ...).
//!
//! ## Guarantees
//! - Deterministic: pure functions of their string inputs
//! - Bounded: every score is in [0,1]
//! - Non-panicking: no `unwrap` or `expect` in any production path
//!
//! One deliberate narrowing of the fuzzy rule: synonyms of three
//! characters or fewer ("oom", "ram", "env", ...) must appear as literal
//! substrings. Nearly every short token sits within edit distance 2 of
//! another, so distance matching on them is all noise.
//!
//! ## NOT Responsible For
//! - Weighing similarity against other evidence (see `confidence`)
//! - Regex signature matching (see `confidence`)

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Edit distance at or below which two words count as a fuzzy match.
const FUZZY_EDIT_LIMIT: usize = 2;

// ---------------------------------------------------------------------------
// Synonym expansion table
// ---------------------------------------------------------------------------

/// Keyword → accepted near-synonyms. A keyword absent from this table is
/// its own only synonym. Entries cover the vocabulary that shows up in
/// build/runtime failure text across ecosystems.
static SYNONYMS: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    HashMap::from([
        ("port", &["port", "ports", "socket", "address"] as &[&str]),
        ("module", &["module", "modules", "package", "dependency", "import"]),
        ("permission", &["permission", "permissions", "access", "denied", "eacces"]),
        ("memory", &["memory", "heap", "ram", "oom"]),
        ("version", &["version", "versions", "release", "semver"]),
        ("install", &["install", "installed", "installation", "add"]),
        ("build", &["build", "builds", "compile", "compilation"]),
        ("timeout", &["timeout", "timeouts", "hang", "stalled"]),
        ("config", &["config", "configuration", "settings", "env"]),
        ("crash", &["crash", "crashed", "panic", "abort", "segfault"]),
    ])
});

// ---------------------------------------------------------------------------
// Edit distance
// ---------------------------------------------------------------------------

/// Levenshtein distance, two-row dynamic programming.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr: Vec<usize> = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ---------------------------------------------------------------------------
// Normalized similarity
// ---------------------------------------------------------------------------

/// Similarity in [0,1]: 1.0 for equal strings, otherwise the mean of an
/// edit-distance ratio and a word-overlap (Jaccard) ratio. Case and
/// surrounding whitespace are ignored.
pub fn normalized_similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let max_len = a.chars().count().max(b.chars().count());
    let edit_ratio = 1.0 - levenshtein(&a, &b) as f64 / max_len as f64;

    let terms_a: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let terms_b: std::collections::HashSet<&str> = b.split_whitespace().collect();
    let union = terms_a.union(&terms_b).count();
    let overlap_ratio = if union == 0 {
        0.0
    } else {
        terms_a.intersection(&terms_b).count() as f64 / union as f64
    };

    ((edit_ratio + overlap_ratio) / 2.0).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Fuzzy keyword matching
// ---------------------------------------------------------------------------

/// Does `keyword` (or one of its synonyms) appear in `description`,
/// either as a literal substring or within edit distance 2 of some word?
/// Synonyms of three characters or fewer match literally only (see the
/// module docs).
pub fn keyword_matches(keyword: &str, description: &str) -> bool {
    let keyword = keyword.trim().to_lowercase();
    if keyword.is_empty() {
        return false;
    }
    let description = description.to_lowercase();

    let expansions: Vec<String> = match SYNONYMS.get(keyword.as_str()) {
        Some(list) => list.iter().map(|s| s.to_string()).collect(),
        None => vec![keyword.clone()],
    };

    for synonym in &expansions {
        if description.contains(synonym.as_str()) {
            return true;
        }
        // Short synonyms produce too many spurious distance-2 matches.
        if synonym.chars().count() <= FUZZY_EDIT_LIMIT + 1 {
            continue;
        }
        for word in description.split(|c: char| !c.is_alphanumeric()) {
            if word.is_empty() {
                continue;
            }
            if levenshtein(synonym, word) <= FUZZY_EDIT_LIMIT {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- levenshtein ---

    #[test]
    fn test_levenshtein_identical() {
        assert_eq!(levenshtein("kitten", "kitten"), 0);
    }

    #[test]
    fn test_levenshtein_classic() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }

    #[test]
    fn test_levenshtein_empty_sides() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("", ""), 0);
    }

    #[test]
    fn test_levenshtein_unicode() {
        assert_eq!(levenshtein("héllo", "hello"), 1);
    }

    // --- normalized_similarity ---

    #[test]
    fn test_similarity_equal_is_one() {
        assert_eq!(normalized_similarity("port in use", "port in use"), 1.0);
    }

    #[test]
    fn test_similarity_case_insensitive() {
        assert_eq!(normalized_similarity("Port In Use", "port in use"), 1.0);
    }

    #[test]
    fn test_similarity_empty_is_zero() {
        assert_eq!(normalized_similarity("", "anything"), 0.0);
    }

    #[test]
    fn test_similarity_unrelated_is_low() {
        assert!(normalized_similarity("port already in use", "zzz qqq xyz") < 0.4);
    }

    #[test]
    fn test_similarity_close_is_high() {
        assert!(normalized_similarity("port in use", "ports in use") > 0.7);
    }

    #[test]
    fn test_similarity_always_in_unit_interval() {
        for (a, b) in [("a", "zzzzzzzz"), ("hello world", "goodbye moon"), ("x", "")] {
            let s = normalized_similarity(a, b);
            assert!((0.0..=1.0).contains(&s), "{} vs {} gave {}", a, b, s);
        }
    }

    // --- keyword_matches ---

    #[test]
    fn test_keyword_literal_substring() {
        assert!(keyword_matches("eaddrinuse", "Error: EADDRINUSE :3000"));
    }

    #[test]
    fn test_keyword_synonym_expansion() {
        // "port" expands to "address", which appears literally.
        assert!(keyword_matches("port", "address already in use"));
    }

    #[test]
    fn test_keyword_fuzzy_within_edit_distance() {
        // "modules" vs "module" synonym list; "modlue" is distance 2 from "module".
        assert!(keyword_matches("module", "cannot find modlue lodash"));
    }

    #[test]
    fn test_keyword_no_match() {
        assert!(!keyword_matches("memory", "port already in use"));
    }

    #[test]
    fn test_keyword_empty_never_matches() {
        assert!(!keyword_matches("", "anything at all"));
    }

    #[test]
    fn test_short_keyword_requires_literal_match() {
        // Two-character keyword: fuzzy matching is disabled for it.
        assert!(!keyword_matches("db", "xy failure"));
        assert!(keyword_matches("db", "db connection refused"));
    }
}
