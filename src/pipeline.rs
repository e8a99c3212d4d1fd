use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::diff::{self, DiffClass};
use crate::error::{PipelineError, StoreError};
use crate::fetch::Fetcher;
use crate::model::Extraction;
use crate::parser::{self, discover::RelatedProject};
use crate::registry::{
    HashEntry, OutcomeCounts, RunId, RunMeta, RunRegistry, UrlOutcome, UrlResult,
};
use crate::store::{self, ArtifactStore, WrittenFile};
use crate::util::slugify;

/// Randomized pause between consecutive fetches.
#[derive(Debug, Clone, Copy)]
pub struct DelayPolicy {
    min_s: f64,
    max_s: f64,
}

impl DelayPolicy {
    pub fn new(min_s: f64, max_s: f64) -> Self {
        DelayPolicy { min_s, max_s }
    }

    pub fn none() -> Self {
        DelayPolicy::new(0.0, 0.0)
    }

    pub fn sample(&self) -> Duration {
        let secs = if self.max_s > self.min_s {
            rand::thread_rng().gen_range(self.min_s..=self.max_s)
        } else {
            self.min_s
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub async fn wait(&self) {
        let d = self.sample();
        if !d.is_zero() {
            debug!("Sleeping {:.2}s", d.as_secs_f64());
            tokio::time::sleep(d).await;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub source: String,
    pub notes: Option<String>,
    /// Also dump the card texts that fed typology parsing.
    pub debug: bool,
    pub show_progress: bool,
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: RunId,
    pub counts: OutcomeCounts,
    /// One per input URL, in input order.
    pub results: Vec<UrlResult>,
    pub summary_path: PathBuf,
}

/// Drives one batch: fetch, extract, diff, persist and record, one URL at a time.
pub struct Orchestrator<'a> {
    fetcher: &'a dyn Fetcher,
    registry: &'a dyn RunRegistry,
    store: &'a ArtifactStore,
    delay: DelayPolicy,
    options: BatchOptions,
}

enum Step {
    Done(UrlOutcome),
    Failed(UrlOutcome, String),
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        fetcher: &'a dyn Fetcher,
        registry: &'a dyn RunRegistry,
        store: &'a ArtifactStore,
        delay: DelayPolicy,
        options: BatchOptions,
    ) -> Self {
        Orchestrator {
            fetcher,
            registry,
            store,
            delay,
            options,
        }
    }

    /// Registry errors abort the batch and leave the run `in_progress`. Everything
    /// else is scoped to its URL.
    pub async fn run_batch(&self, urls: &[String]) -> Result<RunSummary, PipelineError> {
        let urls: Vec<&String> = urls.iter().unique().collect();
        let run_id = self.registry.begin_run(&RunMeta {
            source: self.options.source.clone(),
            urls_count: urls.len(),
            min_delay_s: self.delay.min_s,
            max_delay_s: self.delay.max_s,
            notes: self.options.notes.clone(),
        })?;
        info!("Started {} with {} URLs", run_id, urls.len());

        let pb = self.progress_bar(urls.len());
        let mut counts = OutcomeCounts::default();
        let mut results = Vec::with_capacity(urls.len());

        for (position, url) in urls.into_iter().enumerate() {
            if position > 0 {
                self.delay.wait().await;
            }
            let started = Instant::now();
            let (outcome, error) = match self.process_url(&run_id, url).await? {
                Step::Done(outcome) => (outcome, None),
                Step::Failed(outcome, error) => (outcome, Some(error)),
            };
            let result = UrlResult {
                position,
                url: url.clone(),
                outcome,
                error,
                duration_ms: started.elapsed().as_millis() as u64,
            };
            self.registry.record_url_result(&run_id, &result)?;
            counts.add(&result.outcome);
            results.push(result);
            pb.inc(1);
        }
        pb.finish_and_clear();

        let text = render_summary(&run_id, &self.options, &self.delay, &counts, &results);
        let written = self.store.write_run_summary(run_id.as_str(), &text);
        if let Ok(file) = &written {
            self.registry
                .record_artifact(&run_id, &file.to_artifact(None, "run_summary"))?;
        }
        self.registry.finalize_run(&run_id, &counts)?;
        let summary_path = written?.path;

        info!(
            "Finished {}: {} ok ({} new, {} changed, {} unchanged), {} empty, {} failed",
            run_id,
            counts.success,
            counts.first_seen,
            counts.changed,
            counts.unchanged,
            counts.empty,
            counts.failed
        );

        Ok(RunSummary {
            run_id,
            counts,
            results,
            summary_path,
        })
    }

    async fn process_url(&self, run_id: &RunId, url: &str) -> Result<Step, PipelineError> {
        let slug = slugify(url);

        let body = match self.fetcher.fetch(url).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Fetch failed for {}: {}", url, e);
                return Ok(Step::Failed(UrlOutcome::FetchFailure, e.to_string()));
            }
        };

        let raw = match self.store.write_raw(&slug, &body) {
            Ok(file) => file,
            Err(e) => return Ok(persist_failure(url, e)),
        };

        let html = String::from_utf8_lossy(&body);
        let extraction = parser::extract(&html, url);
        let prior = self.registry.last_successful_hash(run_id, url)?;
        let outcome = diff::diff(&extraction, prior.as_ref().map(|p| p.hash.as_str()));

        let files = match self.write_outputs(&slug, &extraction) {
            Ok(files) => files,
            Err(e) => return Ok(persist_failure(url, e)),
        };

        self.registry.record_outcome(
            run_id,
            &HashEntry {
                url: url.to_string(),
                slug: slug.clone(),
                content_hash: outcome.new_hash.clone(),
                typology_rows: extraction.typologies.len(),
                parse_ok_rows: extraction.parse_ok_rows(),
                parse_fail_rows: extraction.typologies.len() - extraction.parse_ok_rows(),
                extraction_method: extraction.project.extraction_method,
                classification: outcome.classification,
                compare_to_run_id: prior.map(|p| p.run_id),
            },
        )?;

        self.registry
            .record_artifact(run_id, &raw.to_artifact(Some(url), "raw_html"))?;
        for (kind, file) in files {
            self.registry
                .record_artifact(run_id, &file.to_artifact(Some(url), kind))?;
        }

        match outcome.classification {
            DiffClass::Empty if extraction.is_blank() => {
                warn!("Not a project page, nothing recognised: {}", url)
            }
            DiffClass::Empty => warn!(
                "No typologies for {} ({})",
                url,
                extraction.project.extraction_method.as_str()
            ),
            class => info!(
                "{} {} typologies via {} for {}",
                class,
                extraction.typologies.len(),
                extraction.project.extraction_method.as_str(),
                url
            ),
        }
        Ok(Step::Done(UrlOutcome::Extracted(outcome.classification)))
    }

    fn write_outputs(
        &self,
        slug: &str,
        extraction: &Extraction,
    ) -> Result<Vec<(&'static str, WrittenFile)>, StoreError> {
        // A page with nothing recognised gets no tables, only its raw HTML.
        if extraction.is_blank() {
            return Ok(Vec::new());
        }
        let records = self.store.write_records(extraction)?;
        let mut files = vec![
            ("project_table", records.project),
            ("typology_table", records.typologies),
        ];
        if self.options.debug {
            files.push((
                "cards_txt",
                self.store.write_cards_dump(slug, &extraction.card_texts)?,
            ));
        }
        Ok(files)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb
    }
}

fn persist_failure(url: &str, e: StoreError) -> Step {
    warn!("Could not persist output for {}: {}", url, e);
    Step::Failed(UrlOutcome::PersistFailure, e.to_string())
}

fn render_summary(
    run_id: &RunId,
    options: &BatchOptions,
    delay: &DelayPolicy,
    counts: &OutcomeCounts,
    results: &[UrlResult],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "RUN_ID: {}", run_id);
    let _ = writeln!(out, "SOURCE: {}", options.source);
    if let Some(notes) = &options.notes {
        let _ = writeln!(out, "NOTES: {}", notes);
    }
    let _ = writeln!(out, "DELAY: min={}s max={}s", delay.min_s, delay.max_s);
    let _ = writeln!(out);

    let total = results.len();
    for r in results {
        let tag = match r.outcome {
            UrlOutcome::Extracted(DiffClass::Empty) => "[EMPTY]",
            UrlOutcome::Extracted(_) => "[OK]",
            UrlOutcome::FetchFailure | UrlOutcome::PersistFailure => "[FAIL]",
        };
        let _ = write!(
            out,
            "{:<7} {}/{} {:<15} {} ({} ms)",
            tag,
            r.position + 1,
            total,
            r.outcome.label(),
            r.url,
            r.duration_ms
        );
        if let Some(e) = &r.error {
            let _ = write!(out, " - {}", e);
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "TOTAL: {}  OK: {} (first_seen {}, changed {}, unchanged {})  EMPTY: {}  FAILED: {}",
        counts.total(),
        counts.success,
        counts.first_seen,
        counts.changed,
        counts.unchanged,
        counts.empty,
        counts.failed
    );
    out
}

/// Fetch one page and write its two tables, outside any run.
pub async fn scrape_one(
    fetcher: &dyn Fetcher,
    url: &str,
    project_path: &Path,
    typologies_path: &Path,
    raw_dir: Option<&Path>,
) -> Result<Extraction> {
    let body = fetcher
        .fetch(url)
        .await
        .with_context(|| format!("Failed to fetch {}", url))?;
    let slug = slugify(url);
    if let Some(dir) = raw_dir {
        store::write_atomic(&dir.join(format!("{}.html", slug)), &body)?;
    }

    let extraction = parser::extract(&String::from_utf8_lossy(&body), url);
    store::write_project(project_path, &extraction.project)?;
    store::write_typologies(typologies_path, &extraction.typologies)?;
    Ok(extraction)
}

/// Follow the "otros proyectos" carousel of every seed page. Failed seeds are
/// logged and skipped. Results are deduplicated in discovery order.
pub async fn discover_related(
    fetcher: &dyn Fetcher,
    seeds: &[String],
    delay: DelayPolicy,
) -> Vec<RelatedProject> {
    let mut found: Vec<RelatedProject> = Vec::new();
    for (i, seed) in seeds.iter().enumerate() {
        if i > 0 {
            delay.wait().await;
        }
        let body = match fetcher.fetch(seed).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Skipping seed {}: {}", seed, e);
                continue;
            }
        };
        let related = parser::discover::related_projects(&String::from_utf8_lossy(&body), seed);
        debug!("{} related projects on {}", related.len(), seed);
        for project in related {
            if found.iter().any(|p| p.url == project.url) {
                continue;
            }
            debug!(
                id = project.project_id.as_deref().unwrap_or("-"),
                title = project.title.as_deref().unwrap_or("-"),
                price = project.price_text.as_deref().unwrap_or("-"),
                badge = project.badge.as_deref().unwrap_or("-"),
                "Found {}",
                project.url
            );
            found.push(project);
        }
    }
    found
}
