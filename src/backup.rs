//! # Stage: Backup / Rollback Manager
//!
//! ## Responsibility
//! Point-in-time snapshots of the files a solution is about to mutate,
//! and transactional restoration of those snapshots when the solution
//! fails. One directory per backup id under the manager's root, holding
//! the copied files (mirroring their structure relative to the working
//! directory) plus a `metadata.json`.
//!
//! ## Guarantees
//! - A path that does not exist yet is skipped at backup time — there
//!   is nothing to protect
//! - Rollback against an unknown id is a user-visible error; per-file
//!   restore failures are logged and skipped, never abort the rest
//! - Retention pruning keeps only the newest N backups
//!
//! ## NOT Responsible For
//! - Deciding when to back up or roll back (see `executor`)

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{MendError, Result};
use crate::store::now_ms;

/// How many backups `prune` keeps by default.
pub const DEFAULT_RETAIN: usize = 10;

/// Name of the per-backup metadata file.
const METADATA_FILE: &str = "metadata.json";

/// Subdirectory of a backup holding the copied files.
const FILES_DIR: &str = "files";

// ---------------------------------------------------------------------------
// Metadata types
// ---------------------------------------------------------------------------

/// One snapshotted file: where it lives and where its copy went.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    pub original: PathBuf,
    pub snapshot: PathBuf,
}

/// A point-in-time snapshot of files about to be mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub created_at_ms: i64,
    pub working_dir: PathBuf,
    pub entries: Vec<BackupEntry>,
}

/// What a rollback actually restored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackReport {
    pub backup_id: String,
    pub restored: Vec<PathBuf>,
    /// Entries whose snapshot could not be read back or written over
    /// the live file. Best-effort: listed, not fatal.
    pub skipped: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// BackupManager
// ---------------------------------------------------------------------------

/// Creates, restores, and prunes backups under one root directory.
pub struct BackupManager {
    root: PathBuf,
    working_dir: PathBuf,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        BackupManager { root: root.into(), working_dir: working_dir.into() }
    }

    /// Timestamp-prefixed id; lexical order is chronological order,
    /// which is what `latest_id` and `prune` rely on.
    fn new_id() -> String {
        let suffix: String = uuid::Uuid::new_v4().to_string().chars().take(8).collect();
        format!("{:013}-{}", now_ms(), suffix)
    }

    /// Where a live path is mirrored inside a backup directory.
    fn mirror_path(&self, files_dir: &Path, original: &Path) -> PathBuf {
        let relative = original
            .strip_prefix(&self.working_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| {
                // Outside the working directory: mirror the absolute
                // path with the root separator stripped.
                original.components().filter(|c| matches!(c, std::path::Component::Normal(_))).collect()
            });
        files_dir.join(relative)
    }

    /// Snapshot every existing path in `paths`. Returns the written
    /// backup; failure to copy any existing file fails the whole
    /// backup (a partial snapshot is worse than none).
    pub fn create_backup(&self, paths: &[PathBuf]) -> Result<Backup> {
        let id = Self::new_id();
        let backup_dir = self.root.join(&id);
        let files_dir = backup_dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir).map_err(|e| MendError::Backup(e.to_string()))?;

        let mut entries = Vec::new();
        for original in paths {
            if !original.exists() {
                continue;
            }
            let snapshot = self.mirror_path(&files_dir, original);
            if let Some(parent) = snapshot.parent() {
                fs::create_dir_all(parent).map_err(|e| MendError::Backup(e.to_string()))?;
            }
            fs::copy(original, &snapshot).map_err(|e| {
                MendError::Backup(format!("copying {}: {}", original.display(), e))
            })?;
            entries.push(BackupEntry { original: original.clone(), snapshot });
        }

        let backup = Backup {
            id: id.clone(),
            created_at_ms: now_ms(),
            working_dir: self.working_dir.clone(),
            entries,
        };
        let metadata = serde_json::to_string_pretty(&backup)?;
        fs::write(backup_dir.join(METADATA_FILE), metadata)
            .map_err(|e| MendError::Backup(e.to_string()))?;

        tracing::info!(
            target: "mend::backup",
            id = %backup.id,
            files = backup.entries.len(),
            "backup created"
        );
        Ok(backup)
    }

    /// Id of the most recent backup, if any.
    pub fn latest_id(&self) -> Option<String> {
        let mut ids: Vec<String> = fs::read_dir(&self.root)
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(METADATA_FILE).exists())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        ids.sort();
        ids.pop()
    }

    /// Read a backup's metadata.
    pub fn load(&self, id: &str) -> Result<Backup> {
        let metadata_path = self.root.join(id).join(METADATA_FILE);
        let raw = fs::read_to_string(&metadata_path)
            .map_err(|_| MendError::BackupNotFound(Some(id.to_string())))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Restore every file from the backup `id` (latest when `None`).
    /// A missing backup is an error; a missing individual snapshot is
    /// logged and reported as skipped.
    pub fn rollback(&self, id: Option<&str>) -> Result<RollbackReport> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self.latest_id().ok_or(MendError::BackupNotFound(None))?,
        };
        let backup = self.load(&id)?;

        let mut restored = Vec::new();
        let mut skipped = Vec::new();
        for entry in &backup.entries {
            if let Some(parent) = entry.original.parent() {
                let _ = fs::create_dir_all(parent);
            }
            match fs::copy(&entry.snapshot, &entry.original) {
                Ok(_) => restored.push(entry.original.clone()),
                Err(e) => {
                    tracing::warn!(
                        target: "mend::backup",
                        path = %entry.original.display(),
                        error = %e,
                        "file restore failed, continuing rollback"
                    );
                    skipped.push(entry.original.clone());
                }
            }
        }

        tracing::info!(
            target: "mend::backup",
            id = %id,
            restored = restored.len(),
            skipped = skipped.len(),
            "rollback complete"
        );
        Ok(RollbackReport { backup_id: id, restored, skipped })
    }

    /// Delete all but the newest `keep` backups.
    pub fn prune(&self, keep: usize) -> Result<usize> {
        let mut ids: Vec<String> = match fs::read_dir(&self.root) {
            Ok(dir) => dir
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(_) => return Ok(0),
        };
        ids.sort();
        let mut removed = 0;
        while ids.len() > keep {
            let id = ids.remove(0);
            if let Err(e) = fs::remove_dir_all(self.root.join(&id)) {
                tracing::warn!(target: "mend::backup", id = %id, error = %e, "prune failed");
            } else {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
