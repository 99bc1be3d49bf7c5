//! Crate-level error type.
//!
//! Everything that can go wrong inside the engine is funneled into
//! [`MendError`]. The taxonomy mirrors the failure semantics of the
//! engine's stages: store access, backup creation, step execution,
//! post-apply validation, and rollback. I/O and serialization errors
//! are wrapped via `#[from]` so call sites can use `?` throughout.
//!
//! Two non-errors worth noting: "no pattern matched" is an empty
//! candidate list, not an error, and a per-file restore failure during
//! rollback is reported as data in the rollback report rather than
//! aborting the rollback.

use thiserror::Error;

/// All errors surfaced by the mend engine.
#[derive(Debug, Error)]
pub enum MendError {
    /// The primary pattern store could not be opened or queried.
    ///
    /// Recoverable: the engine falls back to the flat-file catalog, so
    /// callers only see this when a direct store operation is requested.
    #[error("pattern store unavailable: {0}")]
    StoreUnavailable(String),

    /// Snapshot creation failed before any step ran. Fatal for the
    /// current apply attempt only; no filesystem mutation was made.
    #[error("backup creation failed: {0}")]
    Backup(String),

    /// A remediation step's side effect failed (non-zero exit, I/O
    /// error, or timeout). Carries the zero-based index of the step.
    #[error("step {index} failed: {message}")]
    Step { index: usize, message: String },

    /// The solution applied cleanly but its validation command did not
    /// confirm the fix. Distinct from `Step` so callers can report
    /// "applied but did not fix the issue".
    #[error("validation failed: {0}")]
    Validation(String),

    /// `rollback` was asked for a backup id that does not exist.
    #[error("no backup to roll back to{}", .0.as_deref().map(|id| format!(" (id: {})", id)).unwrap_or_default())]
    BackupNotFound(Option<String>),

    /// Malformed caller input, e.g. a solution JSON that does not
    /// conform to the step shape. A caller programming error, not an
    /// engine failure.
    #[error("invalid solution: {0}")]
    InvalidSolution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MendError>;
