//! # Stage: Step Executor
//!
//! ## Responsibility
//! Run one solution against the live project directory, transactionally.
//! The lifecycle is a strict state machine:
//!
//! ```text
//! Idle → BackingUp → Executing(i) → { Executing(i+1) | RollingBack | Validating }
//!      → { Succeeded | RolledBack | Failed }
//! ```
//!
//! Backup failure means no step ever runs. Steps run strictly in
//! declared order (later steps may depend on filesystem state earlier
//! ones produced). The first failing step halts the sequence and rolls
//! back everything already applied; a failed post-apply validation takes
//! the same rollback path but is reported as "applied but did not fix
//! the issue". Template substitution and timeout handling are the same
//! for steps and validation.
//!
//! ## Guarantees
//! - All-or-nothing: after `apply`, either every step's effect is on
//!   disk or none is (backed-up files restored byte-identical, files
//!   and directories created during the run removed)
//! - Bounded: every external command runs under a timeout and is killed
//!   when it expires; a caller-supplied overall deadline propagates into
//!   whichever step is running
//! - Non-panicking: failures surface in the returned [`ApplyReport`]
//!
//! ## NOT Responsible For
//! - Selecting the solution (caller) or recording the outcome (engine)

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::backup::{BackupManager, DEFAULT_RETAIN};
use crate::context::EnvironmentContext;
use crate::solution::{substitute, ModifyOp, Solution, SolutionStep, Validation};

/// Package installs get a longer leash than ordinary commands.
const INSTALL_TIMEOUT_MS: u64 = 120_000;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// The stage an apply attempt reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStage {
    Backup,
    Step,
    Validation,
    Complete,
}

/// Everything the caller needs to know about one apply attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub success: bool,
    /// Stage reached when the attempt ended.
    pub stage: ApplyStage,
    /// Human-readable descriptions of applied changes, in order.
    pub changes: Vec<String>,
    pub backup_id: Option<String>,
    /// Zero-based index of the failing step, when `stage == Step`.
    pub failed_step: Option<usize>,
    pub message: String,
    /// Whether rollback ran and restored the pre-apply state.
    pub rolled_back: bool,
}

impl ApplyReport {
    fn succeeded(changes: Vec<String>, backup_id: String) -> Self {
        ApplyReport {
            success: true,
            stage: ApplyStage::Complete,
            message: format!("applied {} steps", changes.len()),
            changes,
            backup_id: Some(backup_id),
            failed_step: None,
            rolled_back: false,
        }
    }
}

/// Outcome of one command run: exit code (None when killed) plus
/// combined output.
struct CommandResult {
    exit_code: Option<i32>,
    output: String,
    timed_out: bool,
}

/// Paths one apply attempt brought into existence. The backup only
/// restores what existed beforehand, so rollback removes these.
#[derive(Default)]
struct CreatedPaths {
    files: Vec<PathBuf>,
    /// Deepest-first, so `remove_dir` peels them in reverse creation
    /// order.
    dirs: Vec<PathBuf>,
}

impl CreatedPaths {
    /// Record every ancestor of `dir` that does not exist yet. Called
    /// before the `create_dir_all` that brings them into being.
    fn note_missing_dirs(&mut self, dir: &Path) {
        let mut cursor = dir;
        while !cursor.exists() {
            self.dirs.push(cursor.to_path_buf());
            match cursor.parent() {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SolutionApplier
// ---------------------------------------------------------------------------

/// Applies solutions to a project directory, with backup and rollback.
pub struct SolutionApplier {
    working_dir: PathBuf,
    backups: BackupManager,
    /// How many backups survive retention pruning after a success.
    retain: usize,
}

impl SolutionApplier {
    pub fn new(working_dir: impl Into<PathBuf>, backups: BackupManager) -> Self {
        SolutionApplier { working_dir: working_dir.into(), backups, retain: DEFAULT_RETAIN }
    }

    pub fn with_retention(mut self, retain: usize) -> Self {
        self.retain = retain;
        self
    }

    /// Apply with no overall deadline.
    pub async fn apply(&self, solution: &Solution, ctx: &EnvironmentContext) -> ApplyReport {
        self.apply_with_deadline(solution, ctx, None).await
    }

    /// Apply the solution; the state machine described in the module
    /// docs. `overall` bounds the whole attempt: when it expires the
    /// running step fails, unstarted steps never run, and everything
    /// already applied is rolled back.
    pub async fn apply_with_deadline(
        &self,
        solution: &Solution,
        ctx: &EnvironmentContext,
        overall: Option<Duration>,
    ) -> ApplyReport {
        let started = Instant::now();

        // BackingUp. Failure here is terminal with zero mutations.
        let affected: Vec<PathBuf> = solution
            .affected_files
            .iter()
            .map(|p| self.resolve(&substitute(&p.to_string_lossy(), ctx)))
            .collect();
        let backup = match self.backups.create_backup(&affected) {
            Ok(backup) => backup,
            Err(e) => {
                return ApplyReport {
                    success: false,
                    stage: ApplyStage::Backup,
                    changes: vec![],
                    backup_id: None,
                    failed_step: None,
                    message: format!("backup creation failed, no steps were run: {}", e),
                    rolled_back: false,
                };
            }
        };

        // Executing(i), strictly in declared order.
        let mut changes = Vec::new();
        let mut created = CreatedPaths::default();
        for (index, step) in solution.steps.iter().enumerate() {
            let budget = remaining_budget(started, overall);
            if budget == Some(Duration::ZERO) {
                let rolled_back = self.undo(&backup.id, &created);
                return ApplyReport {
                    success: false,
                    stage: ApplyStage::Step,
                    changes,
                    backup_id: Some(backup.id),
                    failed_step: Some(index),
                    message: format!("overall deadline expired before step {}", index),
                    rolled_back,
                };
            }
            match self.run_step(step, ctx, budget, &mut created).await {
                Ok(change) => {
                    tracing::debug!(target: "mend::executor", step = index, change = %change, "step applied");
                    changes.push(change);
                }
                Err(message) => {
                    tracing::warn!(
                        target: "mend::executor",
                        step = index,
                        error = %message,
                        "step failed, rolling back"
                    );
                    let rolled_back = self.undo(&backup.id, &created);
                    return ApplyReport {
                        success: false,
                        stage: ApplyStage::Step,
                        changes,
                        backup_id: Some(backup.id),
                        failed_step: Some(index),
                        message: format!("step {} failed: {}", index, message),
                        rolled_back,
                    };
                }
            }
        }

        // Validating, when the solution carries a validation procedure.
        if let Some(validation) = &solution.validation {
            let budget = remaining_budget(started, overall);
            if let Err(reason) = self.validate(validation, ctx, budget).await {
                let rolled_back = self.undo(&backup.id, &created);
                return ApplyReport {
                    success: false,
                    stage: ApplyStage::Validation,
                    changes,
                    backup_id: Some(backup.id),
                    failed_step: None,
                    message: format!("applied but did not fix the issue: {}", reason),
                    rolled_back,
                };
            }
        }

        // Succeeded. Retention pruning is best-effort.
        if let Err(e) = self.backups.prune(self.retain) {
            tracing::warn!(target: "mend::executor", error = %e, "backup pruning failed");
        }
        ApplyReport::succeeded(changes, backup.id)
    }

    // -- step dispatch -----------------------------------------------------

    /// Run one step. The match is exhaustive over the closed step set.
    async fn run_step(
        &self,
        step: &SolutionStep,
        ctx: &EnvironmentContext,
        budget: Option<Duration>,
        created: &mut CreatedPaths,
    ) -> Result<String, String> {
        match step {
            SolutionStep::Command { command, timeout_ms } => {
                let command = substitute(command, ctx);
                let result = self.run_command(&command, *timeout_ms, budget).await?;
                if result.timed_out {
                    return Err(format!("`{}` timed out", command));
                }
                match result.exit_code {
                    Some(0) => Ok(format!("ran `{}`", command)),
                    Some(code) => Err(format!(
                        "`{}` exited with code {}: {}",
                        command,
                        code,
                        result.output.trim()
                    )),
                    None => Err(format!("`{}` was killed", command)),
                }
            }

            SolutionStep::FileCreate { path, content } => {
                let path = self.resolve(&substitute(path, ctx));
                if let Some(parent) = path.parent() {
                    created.note_missing_dirs(parent);
                    fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                }
                if !path.exists() {
                    created.files.push(path.clone());
                }
                fs::write(&path, substitute(content, ctx)).map_err(|e| e.to_string())?;
                Ok(format!("created {}", path.display()))
            }

            SolutionStep::FileModify { path, operation } => {
                let path = self.resolve(&substitute(path, ctx));
                let content = fs::read_to_string(&path)
                    .map_err(|e| format!("reading {}: {}", path.display(), e))?;
                let modified = apply_modify(&content, operation, ctx);
                fs::write(&path, modified).map_err(|e| e.to_string())?;
                Ok(format!("modified {}", path.display()))
            }

            SolutionStep::FileDelete { path } => {
                let path = self.resolve(&substitute(path, ctx));
                match fs::remove_file(&path) {
                    Ok(_) => Ok(format!("deleted {}", path.display())),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Ok(format!("{} already absent", path.display()))
                    }
                    Err(e) => Err(format!("deleting {}: {}", path.display(), e)),
                }
            }

            SolutionStep::PackageInstall { package, dev } => {
                let package = substitute(package, ctx);
                let manager = ctx.package_manager.as_deref().unwrap_or("npm");
                let dev = dev.unwrap_or_else(|| infer_dev_dependency(&package));
                let command = install_command(manager, &package, dev);
                let result = self.run_command(&command, INSTALL_TIMEOUT_MS, budget).await?;
                if result.timed_out {
                    return Err(format!("`{}` timed out", command));
                }
                match result.exit_code {
                    Some(0) => Ok(format!("installed {} via {}", package, manager)),
                    _ => Err(format!("`{}` failed: {}", command, result.output.trim())),
                }
            }

            SolutionStep::EnvUpdate { key, value } => {
                let path = self.working_dir.join(".env");
                let value = substitute(value, ctx);
                if !path.exists() {
                    created.files.push(path.clone());
                }
                let updated = upsert_env_line(
                    &fs::read_to_string(&path).unwrap_or_default(),
                    key,
                    &value,
                );
                fs::write(&path, updated).map_err(|e| e.to_string())?;
                Ok(format!("set {}={} in .env", key, value))
            }

            SolutionStep::ConfigUpdate { path, merge } => {
                let path = self.resolve(&substitute(path, ctx));
                let mut base: serde_json::Value = match fs::read_to_string(&path) {
                    Ok(raw) => serde_json::from_str(&raw)
                        .map_err(|e| format!("parsing {}: {}", path.display(), e))?,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        created.files.push(path.clone());
                        serde_json::Value::Object(serde_json::Map::new())
                    }
                    Err(e) => return Err(format!("reading {}: {}", path.display(), e)),
                };
                deep_merge(&mut base, merge);
                let pretty =
                    serde_json::to_string_pretty(&base).map_err(|e| e.to_string())?;
                fs::write(&path, pretty).map_err(|e| e.to_string())?;
                Ok(format!("merged config into {}", path.display()))
            }

            SolutionStep::PermissionFix { path, mode } => {
                let path = self.resolve(&substitute(path, ctx));
                set_mode(&path, *mode)
                    .map_err(|e| format!("chmod {}: {}", path.display(), e))?;
                Ok(format!("set mode {:o} on {}", mode, path.display()))
            }
        }
    }

    // -- validation --------------------------------------------------------

    /// Run the validation command and test its predicates. Same
    /// substitution and timeout plumbing as command steps.
    async fn validate(
        &self,
        validation: &Validation,
        ctx: &EnvironmentContext,
        budget: Option<Duration>,
    ) -> Result<(), String> {
        let command = substitute(&validation.command, ctx);
        let result = self.run_command(&command, validation.timeout_ms, budget).await?;
        if result.timed_out {
            return Err(format!("validation `{}` timed out", command));
        }

        if let Some(expected) = validation.expect_exit {
            if result.exit_code != Some(expected) {
                return Err(format!(
                    "validation `{}` exited {:?}, expected {}",
                    command, result.exit_code, expected
                ));
            }
        } else if !matches!(result.exit_code, Some(0)) {
            return Err(format!(
                "validation `{}` exited {:?}",
                command, result.exit_code
            ));
        }

        if let Some(pattern) = &validation.expect_output {
            let re = regex::Regex::new(pattern)
                .map_err(|e| format!("invalid validation pattern `{}`: {}", pattern, e))?;
            if !re.is_match(&result.output) {
                return Err(format!(
                    "validation output did not match `{}`",
                    pattern
                ));
            }
        }
        Ok(())
    }

    // -- plumbing ----------------------------------------------------------

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    /// Shell out, capped at the smaller of the step timeout and the
    /// remaining overall budget. The child is killed when the cap
    /// expires.
    async fn run_command(
        &self,
        command: &str,
        timeout_ms: u64,
        budget: Option<Duration>,
    ) -> Result<CommandResult, String> {
        let step_cap = Duration::from_millis(timeout_ms);
        let cap = match budget {
            Some(budget) => step_cap.min(budget),
            None => step_cap,
        };

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(cap, child).await {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(CommandResult {
                    exit_code: output.status.code(),
                    output: combined,
                    timed_out: false,
                })
            }
            Ok(Err(e)) => Err(format!("spawning `{}`: {}", command, e)),
            Err(_) => Ok(CommandResult { exit_code: None, output: String::new(), timed_out: true }),
        }
    }

    /// Undo a partial apply: remove files and directories this run
    /// created that had no pre-apply counterpart, then restore the
    /// backup. Returns whether the restore itself fully succeeded.
    fn undo(&self, backup_id: &str, created: &CreatedPaths) -> bool {
        for path in &created.files {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        target: "mend::executor",
                        path = %path.display(),
                        error = %e,
                        "could not remove created file during rollback"
                    );
                }
            }
        }
        // Only empty directories go; anything still holding files stays.
        for dir in &created.dirs {
            if let Err(e) = fs::remove_dir(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(
                        target: "mend::executor",
                        path = %dir.display(),
                        error = %e,
                        "created directory left in place during rollback"
                    );
                }
            }
        }
        match self.backups.rollback(Some(backup_id)) {
            Ok(report) => report.skipped.is_empty(),
            Err(e) => {
                tracing::error!(target: "mend::executor", error = %e, "rollback failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

fn remaining_budget(started: Instant, overall: Option<Duration>) -> Option<Duration> {
    overall.map(|total| total.saturating_sub(started.elapsed()))
}

/// Apply a modify operation to file content, substituting placeholders
/// in the operation's text fields.
fn apply_modify(content: &str, operation: &ModifyOp, ctx: &EnvironmentContext) -> String {
    match operation {
        ModifyOp::Replace { find, replace_with } => {
            content.replace(&substitute(find, ctx), &substitute(replace_with, ctx))
        }
        ModifyOp::Append { content: extra } => {
            format!("{}{}", content, substitute(extra, ctx))
        }
        ModifyOp::Prepend { content: extra } => {
            format!("{}{}", substitute(extra, ctx), content)
        }
        ModifyOp::InsertAtLine { line, content: extra } => {
            let mut lines: Vec<&str> = content.lines().collect();
            let extra = substitute(extra, ctx);
            let index = line.saturating_sub(1).min(lines.len());
            lines.insert(index, &extra);
            let mut joined = lines.join("\n");
            if content.ends_with('\n') {
                joined.push('\n');
            }
            joined
        }
    }
}

/// Upsert `KEY=value` into dotenv-style content, preserving other lines.
fn upsert_env_line(content: &str, key: &str, value: &str) -> String {
    let prefix = format!("{}=", key);
    let mut lines: Vec<String> = Vec::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.starts_with(&prefix) {
            lines.push(format!("{}={}", key, value));
            replaced = true;
        } else {
            lines.push(line.to_string());
        }
    }
    if !replaced {
        lines.push(format!("{}={}", key, value));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Recursive object merge; non-object values in the patch overwrite.
fn deep_merge(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, patch_value),
                    None => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base_slot, _) => *base_slot = patch.clone(),
    }
}

/// Heuristic dev/prod classification for packages whose step leaves the
/// flag unspecified. Tooling-shaped names install as dev dependencies.
fn infer_dev_dependency(package: &str) -> bool {
    const DEV_MARKERS: &[&str] = &[
        "@types/", "eslint", "prettier", "jest", "vitest", "mocha", "chai",
        "nodemon", "typescript", "ts-node", "husky", "lint",
    ];
    let package = package.to_lowercase();
    DEV_MARKERS.iter().any(|marker| package.contains(marker))
}

/// The install invocation for each supported package manager.
fn install_command(manager: &str, package: &str, dev: bool) -> String {
    match manager {
        "yarn" => {
            if dev {
                format!("yarn add --dev {}", package)
            } else {
                format!("yarn add {}", package)
            }
        }
        "pnpm" => {
            if dev {
                format!("pnpm add -D {}", package)
            } else {
                format!("pnpm add {}", package)
            }
        }
        "bun" => {
            if dev {
                format!("bun add -d {}", package)
            } else {
                format!("bun add {}", package)
            }
        }
        "cargo" => {
            if dev {
                format!("cargo add --dev {}", package)
            } else {
                format!("cargo add {}", package)
            }
        }
        "pip" => format!("pip install {}", package),
        // npm and anything npm-shaped.
        _ => {
            if dev {
                format!("npm install --save-dev {}", package)
            } else {
                format!("npm install {}", package)
            }
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, _mode: u32) -> std::io::Result<()> {
    // Mode bits have no direct equivalent here; verify the path exists
    // so a typo still fails loudly.
    fs::metadata(path).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    // --- pure helpers ---

    #[test]
    fn test_deep_merge_nested_objects() {
        let mut base = serde_json::json!({"a": {"x": 1, "y": 2}, "keep": true});
        deep_merge(&mut base, &serde_json::json!({"a": {"y": 9, "z": 3}}));
        assert_eq!(base, serde_json::json!({"a": {"x": 1, "y": 9, "z": 3}, "keep": true}));
    }

    #[test]
    fn test_deep_merge_scalar_overwrites_object() {
        let mut base = serde_json::json!({"a": {"x": 1}});
        deep_merge(&mut base, &serde_json::json!({"a": 5}));
        assert_eq!(base, serde_json::json!({"a": 5}));
    }

    #[test]
    fn test_upsert_env_line_replaces_existing() {
        let out = upsert_env_line("PORT=3000\nDEBUG=1\n", "PORT", "4000");
        assert_eq!(out, "PORT=4000\nDEBUG=1\n");
    }

    #[test]
    fn test_upsert_env_line_appends_new() {
        let out = upsert_env_line("DEBUG=1\n", "PORT", "4000");
        assert_eq!(out, "DEBUG=1\nPORT=4000\n");
    }

    #[test]
    fn test_upsert_env_line_empty_file() {
        assert_eq!(upsert_env_line("", "PORT", "4000"), "PORT=4000\n");
    }

    #[test]
    fn test_apply_modify_insert_at_line_clamps() {
        let ctx = EnvironmentContext::default();
        let op = ModifyOp::InsertAtLine { line: 99, content: "tail".into() };
        assert_eq!(apply_modify("a\nb", &op, &ctx), "a\nb\ntail");
    }

    #[test]
    fn test_apply_modify_insert_preserves_trailing_newline() {
        let ctx = EnvironmentContext::default();
        let op = ModifyOp::InsertAtLine { line: 1, content: "top".into() };
        assert_eq!(apply_modify("a\nb\n", &op, &ctx), "top\na\nb\n");
    }

    #[test]
    fn test_apply_modify_replace_substitutes_placeholders() {
        let mut ctx = EnvironmentContext::default();
        ctx.vars.insert("port".into(), "4000".into());
        let op = ModifyOp::Replace { find: "3000".into(), replace_with: "${port}".into() };
        assert_eq!(apply_modify("listen(3000)", &op, &ctx), "listen(4000)");
    }

    #[rstest]
    #[case("npm", "lodash", false, "npm install lodash")]
    #[case("npm", "jest", true, "npm install --save-dev jest")]
    #[case("yarn", "lodash", false, "yarn add lodash")]
    #[case("pnpm", "typescript", true, "pnpm add -D typescript")]
    #[case("bun", "eslint", true, "bun add -d eslint")]
    #[case("cargo", "serde", false, "cargo add serde")]
    #[case("pip", "requests", false, "pip install requests")]
    fn test_install_command_per_manager(
        #[case] manager: &str,
        #[case] package: &str,
        #[case] dev: bool,
        #[case] expected: &str,
    ) {
        assert_eq!(install_command(manager, package, dev), expected);
    }

    #[rstest]
    #[case("@types/node", true)]
    #[case("eslint-plugin-react", true)]
    #[case("typescript", true)]
    #[case("express", false)]
    #[case("lodash", false)]
    fn test_infer_dev_dependency(#[case] package: &str, #[case] expected: bool) {
        assert_eq!(infer_dev_dependency(package), expected);
    }

    #[test]
    fn test_remaining_budget_saturates_at_zero() {
        let started = Instant::now() - Duration::from_secs(10);
        let budget = remaining_budget(started, Some(Duration::from_secs(1)));
        assert_eq!(budget, Some(Duration::ZERO));
    }

    #[test]
    fn test_remaining_budget_none_without_deadline() {
        assert_eq!(remaining_budget(Instant::now(), None), None);
    }
}
