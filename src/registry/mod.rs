#[cfg(test)]
pub mod memory;
pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use chrono::Utc;

use crate::diff::DiffClass;
use crate::error::RegistryError;
use crate::model::ExtractionMethod;

#[cfg(test)]
pub use memory::MemoryRegistry;
pub use sqlite::SqliteRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    /// Timestamp-derived, with a random suffix so two batches started in the same
    /// millisecond still get distinct ids.
    pub fn generate() -> Self {
        let ts = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        RunId(format!("run-{}-{:04x}", ts, rand::random::<u16>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        RunId(s)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct RunMeta {
    pub source: String,
    pub urls_count: usize,
    pub min_delay_s: f64,
    pub max_delay_s: f64,
    pub notes: Option<String>,
}

/// Final outcome of one URL within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlOutcome {
    Extracted(DiffClass),
    FetchFailure,
    PersistFailure,
}

impl UrlOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            UrlOutcome::Extracted(DiffClass::FirstSeen) => "success",
            UrlOutcome::Extracted(DiffClass::Changed) => "changed",
            UrlOutcome::Extracted(DiffClass::Unchanged) => "unchanged",
            UrlOutcome::Extracted(DiffClass::Empty) => "empty",
            UrlOutcome::FetchFailure => "fetch-failure",
            UrlOutcome::PersistFailure => "persist-failure",
        }
    }
}

impl fmt::Display for UrlOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for UrlOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(UrlOutcome::Extracted(DiffClass::FirstSeen)),
            "changed" => Ok(UrlOutcome::Extracted(DiffClass::Changed)),
            "unchanged" => Ok(UrlOutcome::Extracted(DiffClass::Unchanged)),
            "empty" => Ok(UrlOutcome::Extracted(DiffClass::Empty)),
            "fetch-failure" => Ok(UrlOutcome::FetchFailure),
            "persist-failure" => Ok(UrlOutcome::PersistFailure),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UrlResult {
    pub position: usize,
    pub url: String,
    pub outcome: UrlOutcome,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// One processed (run, URL) pair. Holds the hash of the structured output, never
/// the records themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct HashEntry {
    pub url: String,
    pub slug: String,
    pub content_hash: String,
    pub typology_rows: usize,
    pub parse_ok_rows: usize,
    pub parse_fail_rows: usize,
    pub extraction_method: ExtractionMethod,
    pub classification: DiffClass,
    pub compare_to_run_id: Option<String>,
}

impl HashEntry {
    pub const PROJECT_ROWS: usize = 1;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorHash {
    pub run_id: String,
    pub hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    /// Extractions with typology rows (first seen, changed or unchanged).
    pub success: usize,
    pub first_seen: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub empty: usize,
    pub failed: usize,
}

impl OutcomeCounts {
    pub fn add(&mut self, outcome: &UrlOutcome) {
        match outcome {
            UrlOutcome::Extracted(DiffClass::Empty) => self.empty += 1,
            UrlOutcome::Extracted(class) => {
                self.success += 1;
                match class {
                    DiffClass::FirstSeen => self.first_seen += 1,
                    DiffClass::Changed => self.changed += 1,
                    DiffClass::Unchanged => self.unchanged += 1,
                    DiffClass::Empty => {}
                }
            }
            UrlOutcome::FetchFailure | UrlOutcome::PersistFailure => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.success + self.empty + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    InProgress,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(RunStatus::InProgress),
            "completed" => Ok(RunStatus::Completed),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: String,
    pub source: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: RunStatus,
    pub urls_count: usize,
    pub counts: OutcomeCounts,
}

#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub run_id: String,
    pub content_hash: String,
    pub classification: DiffClass,
    pub typology_rows: usize,
    pub recorded_at: String,
}

/// A file written during a run, with its checksum.
#[derive(Debug, Clone)]
pub struct ArtifactRecord {
    pub url: Option<String>,
    pub kind: &'static str,
    pub path: String,
    pub sha256: Option<String>,
    pub bytes: u64,
    pub rows: Option<usize>,
}

/// Append-only ledger of runs and per-URL hash history.
///
/// Writes are single atomic appends. `last_successful_hash` answers as of the
/// moment `run_id` began: entries appended afterwards (by a concurrent batch) are
/// not visible to it, entries of earlier runs are, finalized or not.
pub trait RunRegistry {
    fn begin_run(&self, meta: &RunMeta) -> Result<RunId, RegistryError>;

    /// Fails with `DuplicateEntry` if the URL already has an entry in this run.
    fn record_outcome(&self, run_id: &RunId, entry: &HashEntry) -> Result<(), RegistryError>;

    fn record_url_result(&self, run_id: &RunId, result: &UrlResult) -> Result<(), RegistryError>;

    fn record_artifact(&self, run_id: &RunId, artifact: &ArtifactRecord)
        -> Result<(), RegistryError>;

    fn last_successful_hash(
        &self,
        run_id: &RunId,
        url: &str,
    ) -> Result<Option<PriorHash>, RegistryError>;

    /// Closes the run. A closed run is never reopened.
    fn finalize_run(&self, run_id: &RunId, counts: &OutcomeCounts) -> Result<(), RegistryError>;

    fn runs(&self, limit: usize) -> Result<Vec<RunInfo>, RegistryError>;

    fn history(&self, url: &str) -> Result<Vec<HistoryRow>, RegistryError>;

    /// Per-URL diagnostics of a run, in input order.
    fn url_results(&self, run_id: &RunId) -> Result<Vec<UrlResult>, RegistryError>;

    fn entries_for_run(&self, run_id: &RunId) -> Result<Vec<HashEntry>, RegistryError>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every registry backend must share.

    use super::*;

    pub fn meta() -> RunMeta {
        RunMeta {
            source: "test".into(),
            urls_count: 1,
            min_delay_s: 0.0,
            max_delay_s: 0.0,
            notes: None,
        }
    }

    pub fn entry(url: &str, hash: &str, class: DiffClass) -> HashEntry {
        HashEntry {
            url: url.into(),
            slug: crate::util::slugify(url),
            content_hash: hash.into(),
            typology_rows: if class == DiffClass::Empty { 0 } else { 3 },
            parse_ok_rows: 3,
            parse_fail_rows: 0,
            extraction_method: ExtractionMethod::Primary,
            classification: class,
            compare_to_run_id: None,
        }
    }

    pub fn no_prior_hash_for_new_url(reg: &dyn RunRegistry) {
        let run = reg.begin_run(&meta()).unwrap();
        assert_eq!(reg.last_successful_hash(&run, "https://x.pe/a").unwrap(), None);
    }

    pub fn duplicate_entry_rejected(reg: &dyn RunRegistry) {
        let run = reg.begin_run(&meta()).unwrap();
        let e = entry("https://x.pe/a", "h1", DiffClass::FirstSeen);
        reg.record_outcome(&run, &e).unwrap();
        let err = reg.record_outcome(&run, &e).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateEntry { .. }));
        assert_eq!(reg.entries_for_run(&run).unwrap().len(), 1);
    }

    pub fn history_across_runs(reg: &dyn RunRegistry) {
        let url = "https://x.pe/a";
        let r1 = reg.begin_run(&meta()).unwrap();
        reg.record_outcome(&r1, &entry(url, "h1", DiffClass::FirstSeen)).unwrap();
        reg.finalize_run(&r1, &OutcomeCounts::default()).unwrap();

        let r2 = reg.begin_run(&meta()).unwrap();
        let prior = reg.last_successful_hash(&r2, url).unwrap().unwrap();
        assert_eq!(prior.hash, "h1");
        assert_eq!(prior.run_id, r1.as_str());
        reg.record_outcome(&r2, &entry(url, "h1", DiffClass::Unchanged)).unwrap();
        reg.finalize_run(&r2, &OutcomeCounts::default()).unwrap();

        let history = reg.history(url).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|h| h.content_hash == "h1"));
    }

    pub fn empty_entries_are_not_a_baseline(reg: &dyn RunRegistry) {
        let url = "https://x.pe/a";
        let r1 = reg.begin_run(&meta()).unwrap();
        reg.record_outcome(&r1, &entry(url, "good", DiffClass::FirstSeen)).unwrap();
        reg.finalize_run(&r1, &OutcomeCounts::default()).unwrap();

        let r2 = reg.begin_run(&meta()).unwrap();
        reg.record_outcome(&r2, &entry(url, "blank", DiffClass::Empty)).unwrap();
        reg.finalize_run(&r2, &OutcomeCounts::default()).unwrap();

        let r3 = reg.begin_run(&meta()).unwrap();
        let prior = reg.last_successful_hash(&r3, url).unwrap().unwrap();
        assert_eq!(prior.hash, "good");
    }

    pub fn concurrent_run_entries_invisible(reg: &dyn RunRegistry) {
        let url = "https://x.pe/a";
        let early = reg.begin_run(&meta()).unwrap();
        let late = reg.begin_run(&meta()).unwrap();
        // `late` started after `early` began but before it appended anything.
        reg.record_outcome(&early, &entry(url, "h-early", DiffClass::FirstSeen)).unwrap();
        assert_eq!(reg.last_successful_hash(&late, url).unwrap(), None);

        // An interrupted run's entries stay visible to runs begun afterwards.
        let next = reg.begin_run(&meta()).unwrap();
        let prior = reg.last_successful_hash(&next, url).unwrap().unwrap();
        assert_eq!(prior.hash, "h-early");
    }

    pub fn finalized_run_is_closed(reg: &dyn RunRegistry) {
        let run = reg.begin_run(&meta()).unwrap();
        let mut counts = OutcomeCounts::default();
        counts.add(&UrlOutcome::Extracted(DiffClass::FirstSeen));
        counts.add(&UrlOutcome::FetchFailure);
        reg.finalize_run(&run, &counts).unwrap();

        let err = reg
            .record_outcome(&run, &entry("https://x.pe/a", "h", DiffClass::FirstSeen))
            .unwrap_err();
        assert!(matches!(err, RegistryError::RunClosed(_)));
        assert!(matches!(
            reg.finalize_run(&run, &counts).unwrap_err(),
            RegistryError::RunClosed(_)
        ));

        let runs = reg.runs(10).unwrap();
        let info = runs.iter().find(|r| r.run_id == run.as_str()).unwrap();
        assert_eq!(info.status, RunStatus::Completed);
        assert_eq!(info.counts.success, 1);
        assert_eq!(info.counts.failed, 1);
        assert!(info.ended_at.is_some());
    }

    pub fn unfinished_run_stays_in_progress(reg: &dyn RunRegistry) {
        let run = reg.begin_run(&meta()).unwrap();
        reg.record_outcome(&run, &entry("https://x.pe/a", "h", DiffClass::FirstSeen))
            .unwrap();
        let later = reg.begin_run(&meta()).unwrap();
        reg.finalize_run(&later, &OutcomeCounts::default()).unwrap();

        let runs = reg.runs(10).unwrap();
        let info = runs.iter().find(|r| r.run_id == run.as_str()).unwrap();
        assert_eq!(info.status, RunStatus::InProgress);
        assert!(info.ended_at.is_none());
    }

    pub fn url_results_in_input_order(reg: &dyn RunRegistry) {
        let run = reg.begin_run(&meta()).unwrap();
        for (position, url) in [(1, "https://x.pe/b"), (0, "https://x.pe/a")] {
            let outcome = if position == 0 {
                UrlOutcome::Extracted(DiffClass::FirstSeen)
            } else {
                UrlOutcome::FetchFailure
            };
            reg.record_url_result(
                &run,
                &UrlResult {
                    position,
                    url: url.into(),
                    outcome,
                    error: None,
                    duration_ms: 5,
                },
            )
            .unwrap();
        }
        let results = reg.url_results(&run).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "https://x.pe/a");
        assert_eq!(results[1].outcome, UrlOutcome::FetchFailure);
    }

    pub fn unknown_run(reg: &dyn RunRegistry) {
        let ghost = RunId::from("run-ghost".to_string());
        let err = reg
            .record_outcome(&ghost, &entry("https://x.pe/a", "h", DiffClass::FirstSeen))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownRun(_)));
    }

    pub fn all(reg: impl Fn() -> Box<dyn RunRegistry>) {
        no_prior_hash_for_new_url(&*reg());
        duplicate_entry_rejected(&*reg());
        history_across_runs(&*reg());
        empty_entries_are_not_a_baseline(&*reg());
        concurrent_run_entries_invisible(&*reg());
        finalized_run_is_closed(&*reg());
        unfinished_run_stays_in_progress(&*reg());
        url_results_in_input_order(&*reg());
        unknown_run(&*reg());
    }
}
