//! mend — diagnose build/runtime failures and apply remediations safely.
//!
//! The engine takes a free-text failure description plus live
//! environment facts, ranks known failure patterns by confidence,
//! applies a chosen remediation transactionally (backup first, roll
//! back on any failure), optionally verifies the fix, and feeds the
//! outcome back into per-pattern success statistics.
//!
//! Component flow:
//!
//! ```text
//! (description, context)
//!     → PatternMatcher ── queries ──→ PatternStore (SQLite | flat catalog)
//!     → ranked candidates → caller picks one
//!     → SolutionApplier ── snapshots via ──→ BackupManager
//!     → steps run in order, rollback on first failure
//!     → outcome recorded, feeding future confidence scores
//! ```

pub mod backup;
pub mod cli;
pub mod confidence;
pub mod context;
pub mod error;
pub mod executor;
pub mod matcher;
pub mod similarity;
pub mod solution;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use backup::{Backup, BackupManager, RollbackReport};
pub use confidence::{ScoreBreakdown, ScoringConfig};
pub use context::EnvironmentContext;
pub use error::{MendError, Result};
pub use executor::{ApplyReport, ApplyStage, SolutionApplier};
pub use matcher::{MatchCandidate, PatternMatcher};
pub use solution::{Solution, SolutionStep, Validation};
pub use store::{ApplicationOutcome, PatternRecord, PatternStore, StoreStatistics};

/// Directory under the project root holding all engine state
/// (pattern database, flat catalog, backups).
pub const DATA_DIR: &str = ".mend";

/// Subdirectory of the data dir holding backups.
const BACKUPS_DIR: &str = "backups";

// ---------------------------------------------------------------------------
// DiagnosisEngine — the public facade
// ---------------------------------------------------------------------------

/// One diagnosis/remediation engine bound to a project directory.
///
/// The pattern store is an explicit injected instance with one
/// lifecycle, shared by the matcher and the outcome recorder; it is
/// safe to share across concurrent diagnosis tasks because counter
/// updates are serialized inside the store. The project working
/// directory itself is assumed exclusive: the caller must serialize
/// diagnose-and-apply cycles against the same root.
pub struct DiagnosisEngine {
    store: Arc<dyn PatternStore>,
    matcher: PatternMatcher,
    applier: SolutionApplier,
    backups: BackupManager,
    working_dir: PathBuf,
}

impl DiagnosisEngine {
    /// Open the engine for `project_root`, with state under
    /// `<root>/.mend/`. Never fails on store trouble: the store layer
    /// degrades to a flat catalog or an empty one.
    pub fn open(project_root: impl Into<PathBuf>) -> Self {
        Self::open_with_scoring(project_root, ScoringConfig::default())
    }

    /// Like [`open`](Self::open) with explicit scoring constants.
    pub fn open_with_scoring(
        project_root: impl Into<PathBuf>,
        scoring: ScoringConfig,
    ) -> Self {
        let working_dir = project_root.into();
        let data_dir = working_dir.join(DATA_DIR);
        if let Err(e) = std::fs::create_dir_all(&data_dir) {
            tracing::warn!(
                target: "mend::engine",
                path = %data_dir.display(),
                error = %e,
                "could not create data directory"
            );
        }

        let store: Arc<dyn PatternStore> = Arc::from(store::open_store(&data_dir));
        let matcher = PatternMatcher::with_scoring(store.clone(), scoring);
        let backups_root = data_dir.join(BACKUPS_DIR);
        let applier = SolutionApplier::new(
            working_dir.clone(),
            BackupManager::new(backups_root.clone(), working_dir.clone()),
        );
        let backups = BackupManager::new(backups_root, working_dir.clone());

        DiagnosisEngine { store, matcher, applier, backups, working_dir }
    }

    /// Whether the pattern store is running degraded (flat catalog).
    pub fn degraded(&self) -> bool {
        self.store.degraded()
    }

    /// The project directory this engine operates on.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    // -- diagnosis ---------------------------------------------------------

    /// Ranked remediation candidates for a failure description. Empty
    /// when nothing clears the confidence threshold — a structured
    /// "no match", not an error.
    pub fn find_candidates(
        &self,
        description: &str,
        ctx: &EnvironmentContext,
    ) -> Result<Vec<MatchCandidate>> {
        self.matcher.find_candidates(description, ctx)
    }

    // -- remediation -------------------------------------------------------

    /// Apply a solution transactionally. The report always carries a
    /// human-readable message, the stage reached, and whether rollback
    /// restored the pre-apply state.
    pub async fn apply(&self, solution: &Solution, ctx: &EnvironmentContext) -> ApplyReport {
        self.applier.apply(solution, ctx).await
    }

    /// Apply with a caller-supplied overall deadline.
    pub async fn apply_with_deadline(
        &self,
        solution: &Solution,
        ctx: &EnvironmentContext,
        overall: Option<Duration>,
    ) -> ApplyReport {
        self.applier.apply_with_deadline(solution, ctx, overall).await
    }

    /// Restore a backup (the latest when `id` is `None`).
    pub fn rollback(&self, id: Option<&str>) -> Result<RollbackReport> {
        self.backups.rollback(id)
    }

    // -- learning ----------------------------------------------------------

    /// Record an application outcome, best-effort: a persistence
    /// failure is logged and swallowed so statistics trouble never
    /// blocks diagnosis.
    pub fn record_outcome(
        &self,
        pattern_id: &str,
        success: bool,
        ctx: &EnvironmentContext,
        duration_ms: u64,
    ) {
        let outcome = ApplicationOutcome::new(pattern_id, success, ctx, duration_ms);
        if let Err(e) = self.store.record_outcome(&outcome) {
            tracing::warn!(
                target: "mend::engine",
                pattern_id = %pattern_id,
                error = %e,
                "outcome not recorded"
            );
        }
    }

    // -- catalog management ------------------------------------------------

    /// Insert a new pattern (id assigned, counters zeroed).
    pub fn add_pattern(&self, record: PatternRecord) -> Result<String> {
        self.store.add_pattern(record)
    }

    /// The whole catalog, e.g. for export to the flat format.
    pub fn export_catalog(&self) -> Result<Vec<PatternRecord>> {
        self.store.all_patterns()
    }

    /// Bulk-load patterns preserving ids and counters.
    pub fn import_catalog(&self, records: &[PatternRecord]) -> Result<usize> {
        self.store.import_records(records)
    }

    /// Aggregate catalog statistics.
    pub fn statistics(&self) -> Result<StoreStatistics> {
        self.store.statistics()
    }
}
