use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;

use super::{
    ArtifactRecord, HashEntry, HistoryRow, OutcomeCounts, PriorHash, RunId, RunInfo, RunMeta,
    RunRegistry, RunStatus, UrlResult,
};
use crate::error::RegistryError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS runs (
        run_id          TEXT PRIMARY KEY,
        source          TEXT NOT NULL,
        started_at      TEXT NOT NULL,
        ended_at        TEXT,
        status          TEXT NOT NULL CHECK(status IN ('in_progress','completed')),
        urls_count      INTEGER NOT NULL,
        start_seq       INTEGER NOT NULL,
        min_delay_s     REAL NOT NULL DEFAULT 0,
        max_delay_s     REAL NOT NULL DEFAULT 0,
        notes           TEXT,
        success_count   INTEGER NOT NULL DEFAULT 0,
        first_seen_count INTEGER NOT NULL DEFAULT 0,
        changed_count   INTEGER NOT NULL DEFAULT 0,
        unchanged_count INTEGER NOT NULL DEFAULT 0,
        empty_count     INTEGER NOT NULL DEFAULT 0,
        failed_count    INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);

    -- Per-URL outcome of a run, in input order (fetch failures included).
    CREATE TABLE IF NOT EXISTS run_urls (
        run_id      TEXT NOT NULL REFERENCES runs(run_id),
        position    INTEGER NOT NULL,
        url         TEXT NOT NULL,
        outcome     TEXT NOT NULL,
        error_msg   TEXT,
        duration_ms INTEGER NOT NULL,
        created_at  TEXT NOT NULL,
        PRIMARY KEY (run_id, position),
        UNIQUE (run_id, url)
    );

    -- Hash of the structured output for every URL a run actually extracted.
    CREATE TABLE IF NOT EXISTS artifact_hashes (
        seq               INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id            TEXT NOT NULL REFERENCES runs(run_id),
        url               TEXT NOT NULL,
        slug              TEXT NOT NULL,
        content_hash      TEXT NOT NULL,
        project_rows      INTEGER NOT NULL DEFAULT 1,
        typology_rows     INTEGER NOT NULL,
        parse_ok_rows     INTEGER NOT NULL,
        parse_fail_rows   INTEGER NOT NULL,
        extraction_method TEXT NOT NULL,
        classification    TEXT NOT NULL
            CHECK(classification IN ('first_seen','unchanged','changed','empty')),
        compare_to_run_id TEXT,
        created_at        TEXT NOT NULL,
        UNIQUE (run_id, url)
    );
    CREATE INDEX IF NOT EXISTS idx_hashes_url ON artifact_hashes(url, seq);

    CREATE TABLE IF NOT EXISTS artifacts (
        run_id        TEXT NOT NULL REFERENCES runs(run_id),
        url           TEXT,
        artifact_type TEXT NOT NULL,
        path          TEXT NOT NULL,
        sha256        TEXT,
        bytes         INTEGER NOT NULL,
        rows          INTEGER,
        created_at    TEXT NOT NULL,
        PRIMARY KEY (run_id, path)
    );
";

/// SQLite-backed registry. Every write runs in an IMMEDIATE transaction, so
/// concurrent batches on the same file are serialized by SQLite's writer lock.
pub struct SqliteRegistry {
    conn: Connection,
}

impl SqliteRegistry {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                RegistryError::WriteFailure(format!("{}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        debug!("Opened registry {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, RegistryError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteRegistry { conn })
    }

    fn write_tx(&self) -> Result<Transaction<'_>, RegistryError> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse<T: FromStr<Err = String>>(s: &str) -> Result<T, RegistryError> {
    s.parse().map_err(RegistryError::Corrupt)
}

fn run_status(conn: &Connection, run_id: &RunId) -> Result<RunStatus, RegistryError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM runs WHERE run_id = ?1",
            [run_id.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    match status {
        Some(s) => parse(&s),
        None => Err(RegistryError::UnknownRun(run_id.to_string())),
    }
}

fn require_open(conn: &Connection, run_id: &RunId) -> Result<(), RegistryError> {
    match run_status(conn, run_id)? {
        RunStatus::InProgress => Ok(()),
        RunStatus::Completed => Err(RegistryError::RunClosed(run_id.to_string())),
    }
}

impl RunRegistry for SqliteRegistry {
    fn begin_run(&self, meta: &RunMeta) -> Result<RunId, RegistryError> {
        let run_id = RunId::generate();
        let tx = self.write_tx()?;
        let start_seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM artifact_hashes",
            [],
            |r| r.get(0),
        )?;
        tx.execute(
            "INSERT INTO runs
             (run_id, source, started_at, status, urls_count, start_seq, min_delay_s, max_delay_s, notes)
             VALUES (?1, ?2, ?3, 'in_progress', ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id.as_str(),
                meta.source,
                now(),
                meta.urls_count,
                start_seq,
                meta.min_delay_s,
                meta.max_delay_s,
                meta.notes,
            ],
        )?;
        tx.commit()?;
        Ok(run_id)
    }

    fn record_outcome(&self, run_id: &RunId, entry: &HashEntry) -> Result<(), RegistryError> {
        let tx = self.write_tx()?;
        require_open(&tx, run_id)?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM artifact_hashes WHERE run_id = ?1 AND url = ?2)",
            params![run_id.as_str(), entry.url],
            |r| r.get(0),
        )?;
        if exists {
            return Err(RegistryError::DuplicateEntry {
                run_id: run_id.to_string(),
                url: entry.url.clone(),
            });
        }
        tx.execute(
            "INSERT INTO artifact_hashes
             (run_id, url, slug, content_hash, project_rows, typology_rows, parse_ok_rows,
              parse_fail_rows, extraction_method, classification, compare_to_run_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run_id.as_str(),
                entry.url,
                entry.slug,
                entry.content_hash,
                HashEntry::PROJECT_ROWS,
                entry.typology_rows,
                entry.parse_ok_rows,
                entry.parse_fail_rows,
                entry.extraction_method.as_str(),
                entry.classification.as_str(),
                entry.compare_to_run_id,
                now(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn record_url_result(&self, run_id: &RunId, result: &UrlResult) -> Result<(), RegistryError> {
        let tx = self.write_tx()?;
        require_open(&tx, run_id)?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM run_urls WHERE run_id = ?1 AND (url = ?2 OR position = ?3))",
            params![run_id.as_str(), result.url, result.position],
            |r| r.get(0),
        )?;
        if exists {
            return Err(RegistryError::DuplicateEntry {
                run_id: run_id.to_string(),
                url: result.url.clone(),
            });
        }
        tx.execute(
            "INSERT INTO run_urls (run_id, position, url, outcome, error_msg, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id.as_str(),
                result.position,
                result.url,
                result.outcome.label(),
                result.error,
                result.duration_ms as i64,
                now(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn record_artifact(
        &self,
        run_id: &RunId,
        artifact: &ArtifactRecord,
    ) -> Result<(), RegistryError> {
        let tx = self.write_tx()?;
        require_open(&tx, run_id)?;
        tx.execute(
            "INSERT OR REPLACE INTO artifacts
             (run_id, url, artifact_type, path, sha256, bytes, rows, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id.as_str(),
                artifact.url,
                artifact.kind,
                artifact.path,
                artifact.sha256,
                artifact.bytes as i64,
                artifact.rows,
                now(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn last_successful_hash(
        &self,
        run_id: &RunId,
        url: &str,
    ) -> Result<Option<PriorHash>, RegistryError> {
        run_status(&self.conn, run_id)?;
        let row = self
            .conn
            .query_row(
                "SELECT h.run_id, h.content_hash
                 FROM artifact_hashes h
                 WHERE h.url = ?1
                   AND h.classification != 'empty'
                   AND h.seq <= (SELECT start_seq FROM runs WHERE run_id = ?2)
                 ORDER BY h.seq DESC
                 LIMIT 1",
                params![url, run_id.as_str()],
                |r| {
                    Ok(PriorHash {
                        run_id: r.get(0)?,
                        hash: r.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn finalize_run(&self, run_id: &RunId, counts: &OutcomeCounts) -> Result<(), RegistryError> {
        let tx = self.write_tx()?;
        require_open(&tx, run_id)?;
        tx.execute(
            "UPDATE runs
             SET status = 'completed', ended_at = ?2,
                 success_count = ?3, first_seen_count = ?4, changed_count = ?5,
                 unchanged_count = ?6, empty_count = ?7, failed_count = ?8
             WHERE run_id = ?1",
            params![
                run_id.as_str(),
                now(),
                counts.success,
                counts.first_seen,
                counts.changed,
                counts.unchanged,
                counts.empty,
                counts.failed,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn runs(&self, limit: usize) -> Result<Vec<RunInfo>, RegistryError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, source, started_at, ended_at, status, urls_count,
                    success_count, first_seen_count, changed_count, unchanged_count,
                    empty_count, failed_count
             FROM runs
             ORDER BY started_at DESC, run_id DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok((
                    RunInfo {
                        run_id: row.get(0)?,
                        source: row.get(1)?,
                        started_at: row.get(2)?,
                        ended_at: row.get(3)?,
                        status: RunStatus::InProgress,
                        urls_count: row.get(5)?,
                        counts: OutcomeCounts {
                            success: row.get(6)?,
                            first_seen: row.get(7)?,
                            changed: row.get(8)?,
                            unchanged: row.get(9)?,
                            empty: row.get(10)?,
                            failed: row.get(11)?,
                        },
                    },
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(mut info, status)| {
                info.status = parse(&status)?;
                Ok(info)
            })
            .collect()
    }

    fn history(&self, url: &str) -> Result<Vec<HistoryRow>, RegistryError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, content_hash, classification, typology_rows, created_at
             FROM artifact_hashes
             WHERE url = ?1
             ORDER BY seq",
        )?;
        let rows = stmt
            .query_map([url], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, usize>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(run_id, content_hash, class, typology_rows, recorded_at)| {
                Ok(HistoryRow {
                    run_id,
                    content_hash,
                    classification: parse(&class)?,
                    typology_rows,
                    recorded_at,
                })
            })
            .collect()
    }

    fn url_results(&self, run_id: &RunId) -> Result<Vec<UrlResult>, RegistryError> {
        let mut stmt = self.conn.prepare(
            "SELECT position, url, outcome, error_msg, duration_ms
             FROM run_urls
             WHERE run_id = ?1
             ORDER BY position",
        )?;
        let rows = stmt
            .query_map([run_id.as_str()], |row| {
                Ok((
                    row.get::<_, usize>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(position, url, outcome, error, duration_ms)| {
                Ok(UrlResult {
                    position,
                    url,
                    outcome: parse(&outcome)?,
                    error,
                    duration_ms: duration_ms.max(0) as u64,
                })
            })
            .collect()
    }

    fn entries_for_run(&self, run_id: &RunId) -> Result<Vec<HashEntry>, RegistryError> {
        let mut stmt = self.conn.prepare(
            "SELECT url, slug, content_hash, typology_rows, parse_ok_rows, parse_fail_rows,
                    extraction_method, classification, compare_to_run_id
             FROM artifact_hashes
             WHERE run_id = ?1
             ORDER BY seq",
        )?;
        let rows = stmt
            .query_map([run_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, usize>(3)?,
                    row.get::<_, usize>(4)?,
                    row.get::<_, usize>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(url, slug, content_hash, typ, ok, fail, method, class, compare)| {
                Ok(HashEntry {
                    url,
                    slug,
                    content_hash,
                    typology_rows: typ,
                    parse_ok_rows: ok,
                    parse_fail_rows: fail,
                    extraction_method: parse(&method)?,
                    classification: parse(&class)?,
                    compare_to_run_id: compare,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffClass;
    use crate::registry::contract;
    use crate::registry::UrlOutcome;

    #[test]
    fn contract_in_memory() {
        contract::all(|| Box::new(SqliteRegistry::open_in_memory().unwrap()));
    }

    #[test]
    fn history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry/scraper_registry.db");
        let url = "https://x.pe/a";

        let first = {
            let reg = SqliteRegistry::open(&path).unwrap();
            let run = reg.begin_run(&contract::meta()).unwrap();
            reg.record_outcome(&run, &contract::entry(url, "h1", DiffClass::FirstSeen))
                .unwrap();
            // Interrupted: never finalized.
            run
        };

        let reg = SqliteRegistry::open(&path).unwrap();
        let run = reg.begin_run(&contract::meta()).unwrap();
        let prior = reg.last_successful_hash(&run, url).unwrap().unwrap();
        assert_eq!(prior.run_id, first.as_str());

        let runs = reg.runs(10).unwrap();
        let old = runs.iter().find(|r| r.run_id == first.as_str()).unwrap();
        assert_eq!(old.status, RunStatus::InProgress);
    }

    #[test]
    fn two_handles_on_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.db");
        let a = SqliteRegistry::open(&path).unwrap();
        let b = SqliteRegistry::open(&path).unwrap();

        let ra = a.begin_run(&contract::meta()).unwrap();
        let rb = b.begin_run(&contract::meta()).unwrap();
        a.record_outcome(&ra, &contract::entry("https://x.pe/a", "ha", DiffClass::FirstSeen))
            .unwrap();
        b.record_outcome(&rb, &contract::entry("https://x.pe/a", "hb", DiffClass::FirstSeen))
            .unwrap();

        assert_eq!(a.history("https://x.pe/a").unwrap().len(), 2);
        assert_eq!(b.last_successful_hash(&rb, "https://x.pe/a").unwrap(), None);
    }

    #[test]
    fn url_results_reject_duplicates() {
        let reg = SqliteRegistry::open_in_memory().unwrap();
        let run = reg.begin_run(&contract::meta()).unwrap();
        let result = UrlResult {
            position: 0,
            url: "https://x.pe/a".into(),
            outcome: UrlOutcome::FetchFailure,
            error: Some("HTTP 503".into()),
            duration_ms: 12,
        };
        reg.record_url_result(&run, &result).unwrap();
        assert!(matches!(
            reg.record_url_result(&run, &result).unwrap_err(),
            RegistryError::DuplicateEntry { .. }
        ));
    }

    #[test]
    fn artifacts_need_open_run() {
        let reg = SqliteRegistry::open_in_memory().unwrap();
        let run = reg.begin_run(&contract::meta()).unwrap();
        let artifact = ArtifactRecord {
            url: None,
            kind: "run_summary",
            path: "out/run.txt".into(),
            sha256: Some("00".into()),
            bytes: 10,
            rows: None,
        };
        reg.record_artifact(&run, &artifact).unwrap();
        reg.finalize_run(&run, &OutcomeCounts::default()).unwrap();
        assert!(matches!(
            reg.record_artifact(&run, &artifact).unwrap_err(),
            RegistryError::RunClosed(_)
        ));
    }
}
