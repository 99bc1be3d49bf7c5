//! Degraded pattern store: one JSON file holding the whole catalog.
//!
//! Used when the SQLite store cannot be opened. The catalog is loaded
//! into memory once; queries are served from memory and every mutation
//! rewrites the file best-effort (a failed write is logged and
//! swallowed, never surfaced — diagnosis must not be blocked by
//! statistics persistence). When the file is absent the store starts
//! empty rather than erroring.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::context::EnvironmentContext;
use crate::error::{MendError, Result};

use super::{now_ms, ApplicationOutcome, PatternRecord, PatternStore};

/// Flat-file [`PatternStore`], also the last-resort empty catalog.
pub struct CatalogStore {
    patterns: Mutex<Vec<PatternRecord>>,
    path: PathBuf,
}

impl CatalogStore {
    /// Load the catalog at `path`. A missing or unreadable file yields
    /// an empty catalog; a malformed one is logged and treated as empty.
    pub fn open(path: &Path) -> Self {
        let patterns = match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Vec<PatternRecord>>(&raw) {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(
                        target: "mend::store",
                        path = %path.display(),
                        error = %e,
                        "flat catalog is malformed, starting empty"
                    );
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        tracing::info!(
            target: "mend::store",
            path = %path.display(),
            patterns = patterns.len(),
            "pattern store running in degraded (flat catalog) mode"
        );
        CatalogStore {
            patterns: Mutex::new(patterns),
            path: path.to_path_buf(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<PatternRecord>>> {
        self.patterns
            .lock()
            .map_err(|_| MendError::StoreUnavailable("catalog mutex poisoned".to_string()))
    }

    /// Best-effort rewrite of the catalog file.
    fn persist(&self, patterns: &[PatternRecord]) {
        let json = match serde_json::to_string_pretty(patterns) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(target: "mend::store", error = %e, "catalog serialization failed");
                return;
            }
        };
        if let Err(e) = fs::write(&self.path, json) {
            tracing::warn!(
                target: "mend::store",
                path = %self.path.display(),
                error = %e,
                "catalog write failed, keeping in-memory state"
            );
        }
    }
}

impl PatternStore for CatalogStore {
    /// Degraded mode has no server-side filtering: the whole catalog is
    /// returned for local scoring.
    fn find_candidates(&self, _text: &str, _ctx: &EnvironmentContext) -> Result<Vec<PatternRecord>> {
        Ok(self.lock()?.clone())
    }

    fn get(&self, id: &str) -> Result<Option<PatternRecord>> {
        Ok(self.lock()?.iter().find(|p| p.id == id).cloned())
    }

    fn all_patterns(&self) -> Result<Vec<PatternRecord>> {
        Ok(self.lock()?.clone())
    }

    fn add_pattern(&self, mut record: PatternRecord) -> Result<String> {
        if record.id.is_empty() {
            record.id = uuid::Uuid::new_v4().to_string();
        }
        record.total_applications = 0;
        record.successful_applications = 0;
        let now = now_ms();
        record.created_at_ms = now;
        record.updated_at_ms = now;
        let id = record.id.clone();

        let mut patterns = self.lock()?;
        patterns.retain(|p| p.id != id);
        patterns.push(record);
        self.persist(&patterns);
        Ok(id)
    }

    fn record_outcome(&self, outcome: &ApplicationOutcome) -> Result<()> {
        let mut patterns = self.lock()?;
        match patterns.iter_mut().find(|p| p.id == outcome.pattern_id) {
            Some(p) => {
                p.total_applications += 1;
                if outcome.success {
                    p.successful_applications += 1;
                }
                p.updated_at_ms = now_ms();
            }
            None => {
                tracing::warn!(
                    target: "mend::store",
                    pattern_id = %outcome.pattern_id,
                    "outcome recorded for unknown pattern, counters not updated"
                );
                return Ok(());
            }
        }
        self.persist(&patterns);
        Ok(())
    }

    fn import_records(&self, records: &[PatternRecord]) -> Result<usize> {
        let mut patterns = self.lock()?;
        let mut imported = 0;
        for record in records {
            let mut record = record.clone();
            if record.id.is_empty() {
                record.id = uuid::Uuid::new_v4().to_string();
            }
            if record.created_at_ms == 0 {
                record.created_at_ms = now_ms();
            }
            patterns.retain(|p| p.id != record.id);
            patterns.push(record);
            imported += 1;
        }
        self.persist(&patterns);
        Ok(imported)
    }

    fn degraded(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(id: &str, name: &str) -> PatternRecord {
        PatternRecord {
            id: id.to_string(),
            name: name.to_string(),
            category: "test".to_string(),
            keywords: vec!["port".to_string()],
            signatures: vec![],
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

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = CatalogStore::open(&dir.path().join("catalog.json"));
        assert!(store.degraded());
        assert!(store.all_patterns().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        fs::write(&path, "not json at all").unwrap();
        let store = CatalogStore::open(&path);
        assert!(store.all_patterns().unwrap().is_empty());
    }

    #[test]
    fn test_add_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        {
            let store = CatalogStore::open(&path);
            store.add_pattern(sample("", "port-in-use")).unwrap();
        }
        let reloaded = CatalogStore::open(&path);
        let all = reloaded.all_patterns().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "port-in-use");
    }

    #[test]
    fn test_find_candidates_returns_whole_catalog() {
        let dir = TempDir::new().unwrap();
        let store = CatalogStore::open(&dir.path().join("catalog.json"));
        store.add_pattern(sample("", "a")).unwrap();
        store.add_pattern(sample("", "b")).unwrap();
        let hits = store
            .find_candidates("completely unrelated text", &EnvironmentContext::default())
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_record_outcome_updates_counters_and_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        let store = CatalogStore::open(&path);
        let id = store.add_pattern(sample("", "p")).unwrap();
        store
            .record_outcome(&ApplicationOutcome {
                pattern_id: id.clone(),
                success: true,
                duration_ms: 5,
                env_fingerprint: "linux/none/18".into(),
            })
            .unwrap();

        let reloaded = CatalogStore::open(&path);
        let got = reloaded.get(&id).unwrap().unwrap();
        assert_eq!(got.total_applications, 1);
        assert_eq!(got.successful_applications, 1);
    }

    #[test]
    fn test_record_outcome_unknown_pattern_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let store = CatalogStore::open(&dir.path().join("catalog.json"));
        assert!(store
            .record_outcome(&ApplicationOutcome {
                pattern_id: "ghost".into(),
                success: false,
                duration_ms: 1,
                env_fingerprint: "x".into(),
            })
            .is_ok());
    }

    #[test]
    fn test_unwritable_path_is_best_effort() {
        // Writes fail (directory path), reads still work from memory.
        let dir = TempDir::new().unwrap();
        let store = CatalogStore::open(dir.path());
        let id = store.add_pattern(sample("", "p")).unwrap();
        assert!(store.get(&id).unwrap().is_some());
    }
}
