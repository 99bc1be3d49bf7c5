//! # Stage: Pattern Matcher
//!
//! ## Responsibility
//! Orchestrate a diagnosis query: fetch candidate records from the
//! injected [`PatternStore`], score each one with the confidence model,
//! discard weak matches, and return the survivors ranked best-first.
//!
//! ## Guarantees
//! - Deterministic ordering: descending confidence, ties broken by
//!   framework-bonus magnitude (explicit framework evidence wins);
//!   tie detection tolerates float rounding, so totals that differ
//!   only in summation order still count as tied
//! - No candidate at or below the discard threshold is surfaced
//! - An empty result is a normal outcome, not an error
//!
//! ## NOT Responsible For
//! - Choosing which candidate to apply (caller's decision)
//! - Mutating the store (outcome recording goes through the engine)

use std::sync::Arc;

use crate::confidence::{score, ScoreBreakdown, ScoringConfig};
use crate::context::EnvironmentContext;
use crate::error::Result;
use crate::store::{PatternRecord, PatternStore};

/// Fixed-point scale for ranking comparisons: confidences within 1e-9
/// of each other count as tied.
const CONFIDENCE_KEY_SCALE: f64 = 1e9;

/// One ranked diagnosis candidate. Ephemeral; valid for a single
/// matching attempt.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub pattern: PatternRecord,
    /// Clamped confidence in [0,1].
    pub confidence: f64,
    /// Full term decomposition, for tie-breaks and reporting.
    pub breakdown: ScoreBreakdown,
}

/// Scores store candidates against a failure description. The store is
/// injected and shared; the matcher itself holds no mutable state.
pub struct PatternMatcher {
    store: Arc<dyn PatternStore>,
    scoring: ScoringConfig,
}

impl PatternMatcher {
    pub fn new(store: Arc<dyn PatternStore>) -> Self {
        PatternMatcher { store, scoring: ScoringConfig::default() }
    }

    pub fn with_scoring(store: Arc<dyn PatternStore>, scoring: ScoringConfig) -> Self {
        PatternMatcher { store, scoring }
    }

    /// Ranked candidates for `description` under `ctx`. Empty when no
    /// pattern clears the discard threshold.
    pub fn find_candidates(
        &self,
        description: &str,
        ctx: &EnvironmentContext,
    ) -> Result<Vec<MatchCandidate>> {
        let records = self.store.find_candidates(description, ctx)?;
        let mut candidates: Vec<MatchCandidate> = records
            .into_iter()
            .filter_map(|pattern| {
                let breakdown = score(&pattern, description, ctx, &self.scoring);
                if breakdown.total <= self.scoring.discard_threshold {
                    return None;
                }
                Some(MatchCandidate {
                    confidence: breakdown.total,
                    breakdown,
                    pattern,
                })
            })
            .collect();

        // Totals built from the same terms in different orders differ by
        // a few ULPs, so compare on a fixed-precision integer key rather
        // than raw floats; near-ties then fall through to the framework
        // bonus.
        let sort_key = |c: &MatchCandidate| {
            (
                (c.confidence * CONFIDENCE_KEY_SCALE).round() as i64,
                (c.breakdown.framework * CONFIDENCE_KEY_SCALE).round() as i64,
            )
        };
        candidates.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));

        tracing::debug!(
            target: "mend::matcher",
            candidates = candidates.len(),
            "diagnosis query scored"
        );
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::catalog::CatalogStore;
    use crate::store::{Signature, PatternStore};
    use tempfile::TempDir;

    fn record(name: &str, keywords: &[&str], signatures: &[(&str, f64)]) -> PatternRecord {
        PatternRecord {
            id: String::new(),
            name: name.to_string(),
            category: "test".to_string(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            signatures: signatures
                .iter()
                .map(|(p, w)| Signature { pattern: p.to_string(), weight: *w })
                .collect(),
            frameworks: vec![],
            operating_systems: vec![],
            package_managers: vec![],
            runtime_major: None,
            complexity_tiers: vec![],
            total_applications: 0,
            successful_applications: 0,
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    fn matcher_with(records: Vec<PatternRecord>) -> (PatternMatcher, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = CatalogStore::open(&dir.path().join("catalog.json"));
        for r in records {
            store.add_pattern(r).unwrap();
        }
        (PatternMatcher::new(Arc::new(store)), dir)
    }

    #[test]
    fn test_empty_description_yields_no_candidates() {
        let (matcher, _dir) = matcher_with(vec![
            record("port-in-use", &["port", "eaddrinuse"], &[("EADDRINUSE", 0.4)]),
            record("missing-module", &["module", "cannot find"], &[]),
        ]);
        let hits = matcher
            .find_candidates("", &EnvironmentContext::default())
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_port_pattern_outranks_module_pattern() {
        let (matcher, _dir) = matcher_with(vec![
            record(
                "port-in-use",
                &["port", "eaddrinuse", "address"],
                &[("EADDRINUSE", 0.4)],
            ),
            record(
                "missing-module",
                &["module", "cannot find module"],
                &[("Cannot find module", 0.4)],
            ),
        ]);
        let ctx = EnvironmentContext {
            operating_system: Some("linux".into()),
            ..Default::default()
        };
        let hits = matcher
            .find_candidates("EADDRINUSE :3000 address already in use", &ctx)
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].pattern.name, "port-in-use");
        assert!(hits[0].confidence >= 0.6, "got {}", hits[0].confidence);
        assert!(!hits.iter().any(|c| c.pattern.name == "missing-module"));
    }

    #[test]
    fn test_framework_match_wins_ties() {
        let mut with_framework = record("express-crash", &["crash"], &[("boom", 0.4)]);
        with_framework.frameworks = vec!["express".into()];
        // Same textual evidence, no framework affinity; compensate the
        // 0.15 framework bonus with a heavier signature so totals tie.
        // The two sums reach the same value through different additions
        // and are only equal up to rounding.
        let without_framework = record("generic-crash", &["crash"], &[("boom", 0.55)]);

        let (matcher, _dir) = matcher_with(vec![without_framework, with_framework]);
        let ctx = EnvironmentContext {
            framework: Some("express".into()),
            ..Default::default()
        };
        let hits = matcher.find_candidates("boom crash", &ctx).unwrap();
        assert_eq!(hits.len(), 2);
        assert!((hits[0].confidence - hits[1].confidence).abs() < 1e-9);
        assert_eq!(hits[0].pattern.name, "express-crash");
    }

    #[test]
    fn test_discard_threshold_is_tunable() {
        let dir = TempDir::new().unwrap();
        let store = CatalogStore::open(&dir.path().join("catalog.json"));
        store.add_pattern(record("weak", &["qqq"], &[])).unwrap();
        let lenient = ScoringConfig { discard_threshold: 0.0, ..Default::default() };
        let matcher = PatternMatcher::with_scoring(Arc::new(store), lenient);
        // Only the unseen-history 0.05 term fires, which the default
        // threshold would discard.
        let hits = matcher
            .find_candidates("unrelated", &EnvironmentContext::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_candidates_sorted_descending() {
        let (matcher, _dir) = matcher_with(vec![
            record("strong", &["eaddrinuse"], &[("EADDRINUSE", 0.4)]),
            record("weaker", &["eaddrinuse"], &[]),
        ]);
        let hits = matcher
            .find_candidates("EADDRINUSE eaddrinuse", &EnvironmentContext::default())
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].confidence >= hits[1].confidence);
        assert_eq!(hits[0].pattern.name, "strong");
    }
}
