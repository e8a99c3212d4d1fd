use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use super::{
    ArtifactRecord, HashEntry, HistoryRow, OutcomeCounts, PriorHash, RunId, RunInfo, RunMeta,
    RunRegistry, RunStatus, UrlResult,
};
use crate::error::RegistryError;

struct RunRow {
    info: RunInfo,
    start_seq: u64,
    url_results: Vec<UrlResult>,
    artifact_paths: Vec<String>,
}

struct EntryRow {
    seq: u64,
    run_id: String,
    entry: HashEntry,
    recorded_at: String,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    runs: Vec<RunRow>,
    entries: Vec<EntryRow>,
}

impl State {
    fn run(&self, run_id: &RunId) -> Result<&RunRow, RegistryError> {
        self.runs
            .iter()
            .find(|r| r.info.run_id == run_id.as_str())
            .ok_or_else(|| RegistryError::UnknownRun(run_id.to_string()))
    }

    fn open_run(&mut self, run_id: &RunId) -> Result<&mut RunRow, RegistryError> {
        let run = self
            .runs
            .iter_mut()
            .find(|r| r.info.run_id == run_id.as_str())
            .ok_or_else(|| RegistryError::UnknownRun(run_id.to_string()))?;
        if run.info.status == RunStatus::Completed {
            return Err(RegistryError::RunClosed(run_id.to_string()));
        }
        Ok(run)
    }
}

/// Process-local registry with the same visibility rules as the SQLite one, for
/// exercising the batch without a database file.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, RegistryError> {
        self.state
            .lock()
            .map_err(|_| RegistryError::WriteFailure("registry lock poisoned".into()))
    }
}

impl RunRegistry for MemoryRegistry {
    fn begin_run(&self, meta: &RunMeta) -> Result<RunId, RegistryError> {
        let mut state = self.lock()?;
        let run_id = RunId::generate();
        let start_seq = state.next_seq;
        state.runs.push(RunRow {
            info: RunInfo {
                run_id: run_id.to_string(),
                source: meta.source.clone(),
                started_at: Utc::now().to_rfc3339(),
                ended_at: None,
                status: RunStatus::InProgress,
                urls_count: meta.urls_count,
                counts: OutcomeCounts::default(),
            },
            start_seq,
            url_results: Vec::new(),
            artifact_paths: Vec::new(),
        });
        Ok(run_id)
    }

    fn record_outcome(&self, run_id: &RunId, entry: &HashEntry) -> Result<(), RegistryError> {
        let mut state = self.lock()?;
        state.open_run(run_id)?;
        if state
            .entries
            .iter()
            .any(|e| e.run_id == run_id.as_str() && e.entry.url == entry.url)
        {
            return Err(RegistryError::DuplicateEntry {
                run_id: run_id.to_string(),
                url: entry.url.clone(),
            });
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        state.entries.push(EntryRow {
            seq,
            run_id: run_id.to_string(),
            entry: entry.clone(),
            recorded_at: Utc::now().to_rfc3339(),
        });
        Ok(())
    }

    fn record_url_result(&self, run_id: &RunId, result: &UrlResult) -> Result<(), RegistryError> {
        let mut state = self.lock()?;
        let run = state.open_run(run_id)?;
        if run
            .url_results
            .iter()
            .any(|r| r.url == result.url || r.position == result.position)
        {
            return Err(RegistryError::DuplicateEntry {
                run_id: run_id.to_string(),
                url: result.url.clone(),
            });
        }
        run.url_results.push(result.clone());
        Ok(())
    }

    fn record_artifact(
        &self,
        run_id: &RunId,
        artifact: &ArtifactRecord,
    ) -> Result<(), RegistryError> {
        let mut state = self.lock()?;
        let run = state.open_run(run_id)?;
        if !run.artifact_paths.contains(&artifact.path) {
            run.artifact_paths.push(artifact.path.clone());
        }
        Ok(())
    }

    fn last_successful_hash(
        &self,
        run_id: &RunId,
        url: &str,
    ) -> Result<Option<PriorHash>, RegistryError> {
        let state = self.lock()?;
        let cutoff = state.run(run_id)?.start_seq;
        Ok(state
            .entries
            .iter()
            .rev()
            .filter(|e| e.seq <= cutoff)
            .find(|e| e.entry.url == url && e.entry.classification.is_baseline())
            .map(|e| PriorHash {
                run_id: e.run_id.clone(),
                hash: e.entry.content_hash.clone(),
            }))
    }

    fn finalize_run(&self, run_id: &RunId, counts: &OutcomeCounts) -> Result<(), RegistryError> {
        let mut state = self.lock()?;
        let run = state.open_run(run_id)?;
        run.info.status = RunStatus::Completed;
        run.info.ended_at = Some(Utc::now().to_rfc3339());
        run.info.counts = counts.clone();
        Ok(())
    }

    fn runs(&self, limit: usize) -> Result<Vec<RunInfo>, RegistryError> {
        let state = self.lock()?;
        Ok(state
            .runs
            .iter()
            .rev()
            .take(limit)
            .map(|r| r.info.clone())
            .collect())
    }

    fn history(&self, url: &str) -> Result<Vec<HistoryRow>, RegistryError> {
        let state = self.lock()?;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.entry.url == url)
            .map(|e| HistoryRow {
                run_id: e.run_id.clone(),
                content_hash: e.entry.content_hash.clone(),
                classification: e.entry.classification,
                typology_rows: e.entry.typology_rows,
                recorded_at: e.recorded_at.clone(),
            })
            .collect())
    }

    fn url_results(&self, run_id: &RunId) -> Result<Vec<UrlResult>, RegistryError> {
        let state = self.lock()?;
        let mut results = state.run(run_id)?.url_results.clone();
        results.sort_by_key(|r| r.position);
        Ok(results)
    }

    fn entries_for_run(&self, run_id: &RunId) -> Result<Vec<HashEntry>, RegistryError> {
        let state = self.lock()?;
        state.run(run_id)?;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.run_id == run_id.as_str())
            .map(|e| e.entry.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::contract;

    #[test]
    fn shared_contract() {
        contract::all(|| Box::new(MemoryRegistry::new()));
    }

    #[test]
    fn artifact_paths_are_deduplicated() {
        let reg = MemoryRegistry::new();
        let run = reg.begin_run(&contract::meta()).unwrap();
        let artifact = ArtifactRecord {
            url: None,
            kind: "run_summary",
            path: "out/run.txt".into(),
            sha256: None,
            bytes: 0,
            rows: None,
        };
        reg.record_artifact(&run, &artifact).unwrap();
        reg.record_artifact(&run, &artifact).unwrap();
        let state = reg.lock().unwrap();
        assert_eq!(state.run(&run).unwrap().artifact_paths.len(), 1);
    }
}
