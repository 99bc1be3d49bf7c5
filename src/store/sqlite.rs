//! Primary pattern store backed by SQLite.
//!
//! One `patterns` table holds the catalog; list-valued fields are
//! JSON-encoded text columns. An `outcomes` table keeps the append-only
//! application log that the counters summarize. The connection lives
//! behind a `Mutex`, which serializes concurrent `record_outcome` calls
//! so counter increments are never lost; the increment itself is a
//! single relative `UPDATE`, atomic on the SQLite side as well.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::context::EnvironmentContext;
use crate::error::{MendError, Result};

use super::{now_ms, ApplicationOutcome, PatternRecord, PatternStore, Signature};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS patterns (
    id                      TEXT PRIMARY KEY,
    name                    TEXT NOT NULL,
    category                TEXT NOT NULL,
    keywords                TEXT NOT NULL DEFAULT '[]',
    signatures              TEXT NOT NULL DEFAULT '[]',
    frameworks              TEXT NOT NULL DEFAULT '[]',
    operating_systems       TEXT NOT NULL DEFAULT '[]',
    package_managers        TEXT NOT NULL DEFAULT '[]',
    runtime_major           INTEGER,
    complexity_tiers        TEXT NOT NULL DEFAULT '[]',
    total_applications      INTEGER NOT NULL DEFAULT 0,
    successful_applications INTEGER NOT NULL DEFAULT 0,
    created_at_ms           INTEGER NOT NULL,
    updated_at_ms           INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS outcomes (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern_id      TEXT NOT NULL,
    success         INTEGER NOT NULL,
    duration_ms     INTEGER NOT NULL,
    env_fingerprint TEXT NOT NULL,
    recorded_at_ms  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_outcomes_pattern ON outcomes (pattern_id);
";

/// SQLite-backed [`PatternStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`. Fails when the parent
    /// directory does not exist or the file is not a database; the
    /// caller degrades to the flat catalog in that case.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MendError::StoreUnavailable("store mutex poisoned".to_string()))
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<PatternRecord> {
        let keywords: String = row.get("keywords")?;
        let signatures: String = row.get("signatures")?;
        let frameworks: String = row.get("frameworks")?;
        let operating_systems: String = row.get("operating_systems")?;
        let package_managers: String = row.get("package_managers")?;
        let complexity_tiers: String = row.get("complexity_tiers")?;
        Ok(PatternRecord {
            id: row.get("id")?,
            name: row.get("name")?,
            category: row.get("category")?,
            keywords: serde_json::from_str(&keywords).unwrap_or_default(),
            signatures: serde_json::from_str::<Vec<Signature>>(&signatures).unwrap_or_default(),
            frameworks: serde_json::from_str(&frameworks).unwrap_or_default(),
            operating_systems: serde_json::from_str(&operating_systems).unwrap_or_default(),
            package_managers: serde_json::from_str(&package_managers).unwrap_or_default(),
            runtime_major: row.get("runtime_major")?,
            complexity_tiers: serde_json::from_str(&complexity_tiers).unwrap_or_default(),
            total_applications: row.get::<_, i64>("total_applications")? as u64,
            successful_applications: row.get::<_, i64>("successful_applications")? as u64,
            created_at_ms: row.get("created_at_ms")?,
            updated_at_ms: row.get("updated_at_ms")?,
        })
    }

    fn insert_record(conn: &Connection, record: &PatternRecord) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO patterns (
                id, name, category, keywords, signatures, frameworks,
                operating_systems, package_managers, runtime_major,
                complexity_tiers, total_applications,
                successful_applications, created_at_ms, updated_at_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.id,
                record.name,
                record.category,
                serde_json::to_string(&record.keywords)?,
                serde_json::to_string(&record.signatures)?,
                serde_json::to_string(&record.frameworks)?,
                serde_json::to_string(&record.operating_systems)?,
                serde_json::to_string(&record.package_managers)?,
                record.runtime_major,
                serde_json::to_string(&record.complexity_tiers)?,
                record.total_applications as i64,
                record.successful_applications as i64,
                record.created_at_ms,
                record.updated_at_ms,
            ],
        )?;
        Ok(())
    }

    /// Lowercased alphanumeric terms of length ≥ 3, for the crude
    /// server-side pre-filter.
    fn search_terms(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 3)
            .map(str::to_string)
            .collect()
    }
}

impl PatternStore for SqliteStore {
    fn find_candidates(&self, text: &str, _ctx: &EnvironmentContext) -> Result<Vec<PatternRecord>> {
        let terms = Self::search_terms(text);
        let conn = self.lock()?;

        // Pre-filter on keyword/name/category overlap. A miss is not
        // authoritative (fuzzy and regex evidence is evaluated locally),
        // so an empty filtered set falls back to the full catalog.
        if !terms.is_empty() {
            let clause = terms
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    format!(
                        "keywords LIKE ?{n} OR name LIKE ?{n} OR category LIKE ?{n}",
                        n = i + 1
                    )
                })
                .collect::<Vec<_>>()
                .join(" OR ");
            let sql = format!("SELECT * FROM patterns WHERE {}", clause);
            let mut stmt = conn.prepare(&sql)?;
            let like_params: Vec<String> = terms.iter().map(|t| format!("%{}%", t)).collect();
            let rows = stmt.query_map(
                rusqlite::params_from_iter(like_params.iter()),
                Self::row_to_record,
            )?;
            let filtered: Vec<PatternRecord> = rows.collect::<rusqlite::Result<_>>()?;
            if !filtered.is_empty() {
                return Ok(filtered);
            }
        }

        let mut stmt = conn.prepare("SELECT * FROM patterns")?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn get(&self, id: &str) -> Result<Option<PatternRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT * FROM patterns WHERE id = ?1",
                params![id],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn all_patterns(&self) -> Result<Vec<PatternRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM patterns ORDER BY name")?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
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

        let conn = self.lock()?;
        Self::insert_record(&conn, &record)?;
        Ok(record.id)
    }

    fn record_outcome(&self, outcome: &ApplicationOutcome) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE patterns SET
                total_applications = total_applications + 1,
                successful_applications = successful_applications + ?1,
                updated_at_ms = ?2
             WHERE id = ?3",
            params![outcome.success as i64, now_ms(), outcome.pattern_id],
        )?;
        if updated == 0 {
            tracing::warn!(
                target: "mend::store",
                pattern_id = %outcome.pattern_id,
                "outcome recorded for unknown pattern, counters not updated"
            );
            return Ok(());
        }
        conn.execute(
            "INSERT INTO outcomes (pattern_id, success, duration_ms, env_fingerprint, recorded_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                outcome.pattern_id,
                outcome.success as i64,
                outcome.duration_ms as i64,
                outcome.env_fingerprint,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    fn import_records(&self, records: &[PatternRecord]) -> Result<usize> {
        let conn = self.lock()?;
        let mut imported = 0;
        for record in records {
            let mut record = record.clone();
            if record.id.is_empty() {
                record.id = uuid::Uuid::new_v4().to_string();
            }
            if record.created_at_ms == 0 {
                record.created_at_ms = now_ms();
            }
            Self::insert_record(&conn, &record)?;
            imported += 1;
        }
        Ok(imported)
    }

    fn degraded(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, name: &str, keywords: &[&str]) -> PatternRecord {
        PatternRecord {
            id: id.to_string(),
            name: name.to_string(),
            category: "test".to_string(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
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
    fn test_add_and_get_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.add_pattern(sample("", "port-in-use", &["port", "eaddrinuse"])).unwrap();
        assert!(!id.is_empty());
        let got = store.get(&id).unwrap().unwrap();
        assert_eq!(got.name, "port-in-use");
        assert_eq!(got.keywords, vec!["port", "eaddrinuse"]);
    }

    #[test]
    fn test_add_pattern_zeroes_counters() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut record = sample("", "p", &[]);
        record.total_applications = 99;
        record.successful_applications = 98;
        let id = store.add_pattern(record).unwrap();
        let got = store.get(&id).unwrap().unwrap();
        assert_eq!(got.total_applications, 0);
        assert_eq!(got.successful_applications, 0);
    }

    #[test]
    fn test_record_outcome_increments_atomically() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.add_pattern(sample("", "p", &[])).unwrap();
        for _ in 0..3 {
            store
                .record_outcome(&ApplicationOutcome {
                    pattern_id: id.clone(),
                    success: true,
                    duration_ms: 10,
                    env_fingerprint: "linux/none/18".into(),
                })
                .unwrap();
        }
        store
            .record_outcome(&ApplicationOutcome {
                pattern_id: id.clone(),
                success: false,
                duration_ms: 10,
                env_fingerprint: "linux/none/18".into(),
            })
            .unwrap();
        let got = store.get(&id).unwrap().unwrap();
        assert_eq!(got.total_applications, 4);
        assert_eq!(got.successful_applications, 3);
        assert!((got.success_rate() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_record_outcome_unknown_pattern_is_swallowed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store.record_outcome(&ApplicationOutcome {
            pattern_id: "ghost".into(),
            success: true,
            duration_ms: 1,
            env_fingerprint: "x".into(),
        });
        assert!(result.is_ok());
    }

    #[test]
    fn test_find_candidates_prefilters_on_keywords() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add_pattern(sample("", "port-in-use", &["port", "eaddrinuse"])).unwrap();
        store.add_pattern(sample("", "missing-module", &["module", "cannot find"])).unwrap();
        let ctx = EnvironmentContext::default();
        let hits = store.find_candidates("EADDRINUSE on startup", &ctx).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "port-in-use");
    }

    #[test]
    fn test_find_candidates_falls_back_to_full_catalog() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add_pattern(sample("", "a", &["alpha"])).unwrap();
        store.add_pattern(sample("", "b", &["beta"])).unwrap();
        let ctx = EnvironmentContext::default();
        // No term overlap: local scoring still gets the whole catalog.
        let hits = store.find_candidates("zzz qqq", &ctx).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_import_preserves_counters() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut record = sample("seed-1", "seeded", &[]);
        record.total_applications = 10;
        record.successful_applications = 7;
        assert_eq!(store.import_records(&[record]).unwrap(), 1);
        let got = store.get("seed-1").unwrap().unwrap();
        assert_eq!(got.total_applications, 10);
        assert_eq!(got.successful_applications, 7);
    }

    #[test]
    fn test_concurrent_record_outcome_no_lost_updates() {
        let store = std::sync::Arc::new(SqliteStore::open_in_memory().unwrap());
        let id = store.add_pattern(sample("", "p", &[])).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    store
                        .record_outcome(&ApplicationOutcome {
                            pattern_id: id,
                            success: true,
                            duration_ms: 1,
                            env_fingerprint: "linux/none/18".into(),
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let got = store.get(&id).unwrap().unwrap();
        assert_eq!(got.total_applications, 2);
        assert_eq!(got.successful_applications, 2);
    }
}
