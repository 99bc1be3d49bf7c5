//! # Stage: Pattern Store
//!
//! ## Responsibility
//! Durable catalog of known failure patterns with graceful degradation.
//! The primary backing store is SQLite ([`sqlite::SqliteStore`]); when it
//! cannot be opened the engine falls back to a flat JSON catalog
//! ([`catalog::CatalogStore`]) and, when that file is absent too, to an
//! empty in-memory catalog. Callers talk to the [`PatternStore`] trait
//! and never learn which backing is active.
//!
//! ## Guarantees
//! - Store unavailability is recovered via fallback, never fatal
//! - Outcome-counter updates are serialized (no lost increments under
//!   concurrent recording)
//! - `success_rate` is always derived from the two counters, never
//!   stored independently
//! - Patterns are never auto-deleted
//!
//! ## NOT Responsible For
//! - Scoring patterns against a description (see `confidence`)
//! - Deciding which candidate to apply (caller's job)

pub mod catalog;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::context::EnvironmentContext;
use crate::error::Result;

/// Minimum applications before a pattern qualifies for the top-N ranking.
/// Excludes small-sample noise (one lucky fix should not top the chart).
pub const MIN_SAMPLE_FOR_RANKING: u64 = 5;

/// How many patterns the statistics ranking reports.
pub const TOP_RANKED: usize = 5;

/// Unix-epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Default weight applied to a regex signature that declares none.
pub const DEFAULT_SIGNATURE_WEIGHT: f64 = 0.4;

fn default_signature_weight() -> f64 {
    DEFAULT_SIGNATURE_WEIGHT
}

/// A regex over failure text plus the score weight it contributes when
/// it matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    /// Regular expression matched against the raw description.
    pub pattern: String,
    /// Score contribution on match. Defaults to 0.4 in catalog JSON.
    #[serde(default = "default_signature_weight")]
    pub weight: f64,
}

// ---------------------------------------------------------------------------
// PatternRecord
// ---------------------------------------------------------------------------

/// One known failure signature plus its historical remediation success.
///
/// Owned by the store; mutated only through store operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    /// Stable identifier. Empty on insert means "assign one".
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub category: String,
    /// Literal keywords expected in matching descriptions.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Weighted regex signatures.
    #[serde(default)]
    pub signatures: Vec<Signature>,
    /// Frameworks this pattern is known to apply to. Empty = any.
    #[serde(default)]
    pub frameworks: Vec<String>,
    /// Operating systems this pattern is known to apply to. Empty = any.
    #[serde(default)]
    pub operating_systems: Vec<String>,
    /// Package managers this pattern is associated with. Empty = any.
    #[serde(default)]
    pub package_managers: Vec<String>,
    /// Runtime major version affinity, if any.
    #[serde(default)]
    pub runtime_major: Option<u32>,
    /// Complexity tiers this pattern is associated with. Empty = any.
    #[serde(default)]
    pub complexity_tiers: Vec<String>,
    #[serde(default)]
    pub total_applications: u64,
    #[serde(default)]
    pub successful_applications: u64,
    #[serde(default)]
    pub created_at_ms: i64,
    #[serde(default)]
    pub updated_at_ms: i64,
}

impl PatternRecord {
    /// Derived success ratio; 0.5 for a pattern never applied (a neutral
    /// prior, neither trusted nor distrusted).
    pub fn success_rate(&self) -> f64 {
        if self.total_applications == 0 {
            0.5
        } else {
            self.successful_applications as f64 / self.total_applications as f64
        }
    }
}

// ---------------------------------------------------------------------------
// ApplicationOutcome
// ---------------------------------------------------------------------------

/// The result of applying one pattern's solution, fed back into the
/// store to update its success statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationOutcome {
    pub pattern_id: String,
    pub success: bool,
    pub duration_ms: u64,
    /// Compact environment identity, e.g. `linux/express/18`.
    pub env_fingerprint: String,
}

impl ApplicationOutcome {
    pub fn new(pattern_id: &str, success: bool, ctx: &EnvironmentContext, duration_ms: u64) -> Self {
        ApplicationOutcome {
            pattern_id: pattern_id.to_string(),
            success,
            duration_ms,
            env_fingerprint: ctx.fingerprint(),
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Aggregate catalog statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub total_patterns: usize,
    pub total_applications: u64,
    pub successful_applications: u64,
    /// Mean of per-pattern derived success rates.
    pub mean_success_rate: f64,
    /// Pattern count per category.
    pub per_category: HashMap<String, usize>,
    /// Top patterns by success rate, restricted to patterns with at
    /// least [`MIN_SAMPLE_FOR_RANKING`] applications. `(name, rate)`.
    pub top_by_success: Vec<(String, f64)>,
}

fn compute_statistics(patterns: &[PatternRecord]) -> StoreStatistics {
    let mut per_category: HashMap<String, usize> = HashMap::new();
    let mut total_applications = 0u64;
    let mut successful_applications = 0u64;
    let mut rate_sum = 0.0;

    for p in patterns {
        *per_category.entry(p.category.clone()).or_insert(0) += 1;
        total_applications += p.total_applications;
        successful_applications += p.successful_applications;
        rate_sum += p.success_rate();
    }

    let mut ranked: Vec<(String, f64)> = patterns
        .iter()
        .filter(|p| p.total_applications >= MIN_SAMPLE_FOR_RANKING)
        .map(|p| (p.name.clone(), p.success_rate()))
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(TOP_RANKED);

    StoreStatistics {
        total_patterns: patterns.len(),
        total_applications,
        successful_applications,
        mean_success_rate: if patterns.is_empty() {
            0.0
        } else {
            rate_sum / patterns.len() as f64
        },
        per_category,
        top_by_success: ranked,
    }
}

// ---------------------------------------------------------------------------
// PatternStore trait
// ---------------------------------------------------------------------------

/// Backing-store-agnostic catalog interface. Implementations must be
/// shareable across concurrent diagnosis tasks; counter updates in
/// `record_outcome` are serialized internally.
pub trait PatternStore: Send + Sync {
    /// Candidate records for local scoring. The primary store may
    /// pre-filter server-side; the degraded store returns everything.
    fn find_candidates(&self, text: &str, ctx: &EnvironmentContext) -> Result<Vec<PatternRecord>>;

    /// Look up one pattern by id.
    fn get(&self, id: &str) -> Result<Option<PatternRecord>>;

    /// The whole catalog.
    fn all_patterns(&self) -> Result<Vec<PatternRecord>>;

    /// Insert a new pattern. Assigns an id when the record has none and
    /// zeroes its counters. Returns the id.
    fn add_pattern(&self, record: PatternRecord) -> Result<String>;

    /// Append an application outcome: bump the pattern's counters and
    /// persist. Counter updates are atomic per pattern.
    fn record_outcome(&self, outcome: &ApplicationOutcome) -> Result<()>;

    /// Bulk-load records preserving ids and counters (catalog seeding /
    /// migration between backings). Returns how many were imported.
    fn import_records(&self, records: &[PatternRecord]) -> Result<usize>;

    /// Whether this is the degraded (flat-file / in-memory) backing.
    fn degraded(&self) -> bool;

    /// Aggregate statistics over the whole catalog.
    fn statistics(&self) -> Result<StoreStatistics> {
        Ok(compute_statistics(&self.all_patterns()?))
    }
}

// ---------------------------------------------------------------------------
// Store opening with graceful degradation
// ---------------------------------------------------------------------------

/// File name of the primary SQLite store inside the data directory.
pub const PRIMARY_DB_FILE: &str = "patterns.db";

/// File name of the degraded flat catalog inside the data directory.
pub const CATALOG_FILE: &str = "catalog.json";

/// Open the pattern store with graceful degradation: SQLite first, flat
/// JSON catalog second, empty in-memory catalog last. Never fails; an
/// absent data directory simply yields an empty catalog.
pub fn open_store(data_dir: &Path) -> Box<dyn PatternStore> {
    match sqlite::SqliteStore::open(&data_dir.join(PRIMARY_DB_FILE)) {
        Ok(store) => Box::new(store),
        Err(e) => {
            tracing::warn!(
                target: "mend::store",
                error = %e,
                "primary pattern store unavailable, degrading to flat catalog"
            );
            Box::new(catalog::CatalogStore::open(&data_dir.join(CATALOG_FILE)))
        }
    }
}
