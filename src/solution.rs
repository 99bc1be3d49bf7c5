//! # Stage: Solution Model
//!
//! ## Responsibility
//! The declarative shape of a remediation: an ordered list of typed
//! steps, an optional affected-file list (the backup scope), and an
//! optional post-apply validation. Also owns `${key}` template
//! substitution against the environment context, used symmetrically by
//! step execution and validation.
//!
//! ## Guarantees
//! - Closed step set: every kind is an enum variant, handled
//!   exhaustively by the executor — adding a kind is a compile-visible
//!   change, not a string-keyed lookup
//! - Unresolved `${key}` placeholders are left verbatim, never an error
//!
//! ## NOT Responsible For
//! - Running steps (see `executor`) or snapshotting files (see `backup`)

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::context::EnvironmentContext;
use crate::error::{MendError, Result};

/// Default timeout for commands and validations that declare none.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

// ---------------------------------------------------------------------------
// Template substitution
// ---------------------------------------------------------------------------

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_.-]+)\}").expect("placeholder regex is valid"));

/// Replace every `${key}` the context can resolve; unknown keys stay
/// verbatim so a template author can spot them in the output.
pub fn substitute(template: &str, ctx: &EnvironmentContext) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match ctx.lookup(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// How a `file_modify` step edits an existing file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ModifyOp {
    /// Replace every occurrence of `find` with `replace_with`.
    Replace { find: String, replace_with: String },
    /// Append `content` to the end of the file.
    Append { content: String },
    /// Prepend `content` to the start of the file.
    Prepend { content: String },
    /// Insert `content` as a new line before 1-based line `line`
    /// (clamped to the end of the file).
    InsertAtLine { line: usize, content: String },
}

/// One typed remediation step. Closed set; the executor matches
/// exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SolutionStep {
    /// Run an external command through the shell, bounded by a timeout.
    Command {
        command: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// Create (or overwrite) a file with templated content.
    FileCreate { path: String, content: String },
    /// Edit an existing file in place.
    FileModify { path: String, operation: ModifyOp },
    /// Delete a file. Deleting a missing file is not an error.
    FileDelete { path: String },
    /// Install a package via the context's package manager. `dev: None`
    /// means "infer from the package name".
    PackageInstall {
        package: String,
        #[serde(default)]
        dev: Option<bool>,
    },
    /// Upsert a `KEY=value` line in the project's `.env` file.
    EnvUpdate { key: String, value: String },
    /// Deep-merge a JSON object into a structured config file.
    ConfigUpdate { path: String, merge: serde_json::Value },
    /// Set filesystem permissions (octal mode) on a path.
    PermissionFix { path: String, mode: u32 },
}

impl SolutionStep {
    /// Short human-readable label used in change logs and errors.
    pub fn describe(&self) -> String {
        match self {
            SolutionStep::Command { command, .. } => format!("run `{}`", command),
            SolutionStep::FileCreate { path, .. } => format!("create {}", path),
            SolutionStep::FileModify { path, .. } => format!("modify {}", path),
            SolutionStep::FileDelete { path } => format!("delete {}", path),
            SolutionStep::PackageInstall { package, .. } => format!("install {}", package),
            SolutionStep::EnvUpdate { key, .. } => format!("set env {}", key),
            SolutionStep::ConfigUpdate { path, .. } => format!("update config {}", path),
            SolutionStep::PermissionFix { path, mode } => {
                format!("chmod {:o} {}", mode, path)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Post-apply check: run a command and test its result against an exit
/// code and/or an output regex. At least one predicate should be set;
/// with neither, any clean command completion passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub command: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Expected exit code, if any.
    #[serde(default)]
    pub expect_exit: Option<i32>,
    /// Regex the combined stdout/stderr must match, if any.
    #[serde(default)]
    pub expect_output: Option<String>,
}

// ---------------------------------------------------------------------------
// Solution
// ---------------------------------------------------------------------------

/// An ordered, declarative remediation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solution {
    pub steps: Vec<SolutionStep>,
    /// Files snapshotted before any step runs. Paths that do not exist
    /// yet are skipped at backup time.
    #[serde(default)]
    pub affected_files: Vec<PathBuf>,
    #[serde(default)]
    pub validation: Option<Validation>,
}

impl Solution {
    /// Parse a solution from JSON. A malformed shape is a caller
    /// programming error ([`MendError::InvalidSolution`]).
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| MendError::InvalidSolution(e.to_string()))
    }
}
