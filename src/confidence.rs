//! # Stage: Confidence Model
//!
//! ## Responsibility
//! Turn one (pattern, description, context) triple into a single score
//! in [0,1]. Six additive terms: exact keyword overlap, weighted regex
//! signatures, fuzzy keyword similarity, context bonuses (runtime
//! proximity, OS, package manager, complexity tier), framework bonus,
//! and historical success. Intermediate sums may exceed 1; the final
//! score is always clamped before it is surfaced.
//!
//! ## Guarantees
//! - Clamped: `total` is in [0,1]
//! - Monotonic in exact-keyword evidence: more matched keywords never
//!   lower the exact term
//! - Tunable: every hand-tuned constant lives in [`ScoringConfig`] with
//!   the production value as `Default` (the constants have no documented
//!   derivation; they are preserved, not reinterpreted)
//!
//! ## NOT Responsible For
//! - Fetching candidates (see `store`) or ranking them (see `matcher`)

use serde::{Deserialize, Serialize};

use crate::context::EnvironmentContext;
use crate::similarity::keyword_matches;
use crate::store::PatternRecord;

// ---------------------------------------------------------------------------
// ScoringConfig
// ---------------------------------------------------------------------------

/// The hand-tuned scoring constants, exposed so tests and callers can
/// override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Weight of the exact-keyword term.
    pub exact_weight: f64,
    /// Cap applied to the fuzzy-similarity term.
    pub fuzzy_cap: f64,
    /// Contribution of each fuzzily-matched keyword before the cap.
    pub fuzzy_per_keyword: f64,
    /// Bonus when runtime major versions are within `runtime_proximity`.
    pub runtime_bonus: f64,
    /// Maximum major-version distance that still earns `runtime_bonus`.
    pub runtime_proximity: u32,
    /// Bonus for an operating-system affinity match.
    pub os_bonus: f64,
    /// Bonus for a package-manager affinity match.
    pub package_manager_bonus: f64,
    /// Bonus for a complexity-tier affinity match.
    pub tier_bonus: f64,
    /// Bonus when the pattern lists the context's framework.
    pub framework_bonus: f64,
    /// Weight of the historical success-rate term.
    pub history_weight: f64,
    /// Flat historical term for a pattern never applied.
    pub unseen_history: f64,
    /// Candidates scoring at or below this are discarded.
    pub discard_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        ScoringConfig {
            exact_weight: 0.3,
            fuzzy_cap: 0.15,
            fuzzy_per_keyword: 0.5,
            runtime_bonus: 0.1,
            runtime_proximity: 2,
            os_bonus: 0.05,
            package_manager_bonus: 0.05,
            tier_bonus: 0.05,
            framework_bonus: 0.15,
            history_weight: 0.1,
            unseen_history: 0.05,
            discard_threshold: 0.3,
        }
    }
}

// ---------------------------------------------------------------------------
// ScoreBreakdown
// ---------------------------------------------------------------------------

/// Per-term decomposition of one score, kept for ranking tie-breaks and
/// "why did this match" reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub exact: f64,
    pub signature: f64,
    pub fuzzy: f64,
    pub context: f64,
    pub framework: f64,
    pub history: f64,
    /// Clamped sum of the terms.
    pub total: f64,
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

fn contains_ignore_case(haystack: &[String], needle: &str) -> bool {
    haystack.iter().any(|h| h.eq_ignore_ascii_case(needle))
}

/// Score one pattern against a description and environment context.
pub fn score(
    pattern: &PatternRecord,
    description: &str,
    ctx: &EnvironmentContext,
    config: &ScoringConfig,
) -> ScoreBreakdown {
    let description_lower = description.to_lowercase();
    let mut breakdown = ScoreBreakdown::default();

    // 1. Exact keyword overlap.
    if !pattern.keywords.is_empty() {
        let matched = pattern
            .keywords
            .iter()
            .filter(|k| description_lower.contains(&k.to_lowercase()))
            .count();
        breakdown.exact = config.exact_weight * matched as f64 / pattern.keywords.len() as f64;
    }

    // 2. Weighted regex signatures. An unparseable signature is a
    // catalog defect; it contributes nothing.
    for sig in &pattern.signatures {
        match regex::Regex::new(&sig.pattern) {
            Ok(re) => {
                if re.is_match(description) {
                    breakdown.signature += sig.weight;
                }
            }
            Err(e) => {
                tracing::debug!(
                    target: "mend::confidence",
                    pattern = %pattern.name,
                    signature = %sig.pattern,
                    error = %e,
                    "skipping malformed signature regex"
                );
            }
        }
    }

    // 3. Fuzzy keyword similarity, capped.
    let fuzzy_hits = pattern
        .keywords
        .iter()
        .filter(|k| keyword_matches(k, description))
        .count();
    breakdown.fuzzy =
        config.fuzzy_cap * (config.fuzzy_per_keyword * fuzzy_hits as f64).min(1.0);

    // 4. Context bonuses.
    if let (Some(pattern_major), Some(ctx_major)) = (pattern.runtime_major, ctx.runtime_major()) {
        if pattern_major.abs_diff(ctx_major) <= config.runtime_proximity {
            breakdown.context += config.runtime_bonus;
        }
    }
    if let Some(os) = ctx.operating_system.as_deref() {
        if contains_ignore_case(&pattern.operating_systems, os) {
            breakdown.context += config.os_bonus;
        }
    }
    if let Some(pm) = ctx.package_manager.as_deref() {
        if contains_ignore_case(&pattern.package_managers, pm) {
            breakdown.context += config.package_manager_bonus;
        }
    }
    if let Some(tier) = ctx.complexity_tier.as_deref() {
        if contains_ignore_case(&pattern.complexity_tiers, tier) {
            breakdown.context += config.tier_bonus;
        }
    }

    // 5. Framework bonus — kept separate from the context term because
    // ties in total score are broken by framework evidence.
    if let Some(framework) = ctx.framework.as_deref() {
        if contains_ignore_case(&pattern.frameworks, framework) {
            breakdown.framework = config.framework_bonus;
        }
    }

    // 6. Historical success.
    breakdown.history = if pattern.total_applications == 0 {
        config.unseen_history
    } else {
        config.history_weight * pattern.success_rate()
    };

    breakdown.total = (breakdown.exact
        + breakdown.signature
        + breakdown.fuzzy
        + breakdown.context
        + breakdown.framework
        + breakdown.history)
        .clamp(0.0, 1.0);
    breakdown
}
