mod diff;
mod error;
mod fetch;
mod model;
mod parser;
mod pipeline;
mod registry;
mod settings;
mod store;
mod util;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use fetch::HttpFetcher;
use pipeline::{BatchOptions, DelayPolicy, Orchestrator};
use registry::{RunRegistry, RunStatus, SqliteRegistry};
use settings::Settings;
use store::ArtifactStore;

#[derive(Parser)]
#[command(name = "nexo_scraper", about = "Nexo Inmobiliario project scraper with run registry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape one project page into a project table and a typology table
    Scrape {
        url: String,
        /// Project table path (JSON)
        output_project: PathBuf,
        /// Typology table path (default: next to the project table)
        #[arg(long)]
        output_typologies: Option<PathBuf>,
        /// Also keep the raw HTML here
        #[arg(long)]
        raw_dir: Option<PathBuf>,
    },
    /// Scrape every URL of a list, diffing each page against its last successful run
    Batch {
        /// One URL per line, `#` comments allowed
        #[arg(long)]
        urls_file: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        /// Raw HTML directory (default: <out-dir>/raw)
        #[arg(long)]
        raw_dir: Option<PathBuf>,
        #[arg(long)]
        registry_db: Option<PathBuf>,
        /// Minimum pause between URLs, in seconds
        #[arg(long)]
        min_delay: Option<f64>,
        /// Maximum pause between URLs, in seconds
        #[arg(long)]
        max_delay: Option<f64>,
        /// Verbose logs and a card dump per URL
        #[arg(long)]
        debug: bool,
    },
    /// Collect related-project links from seed pages into a URL list
    Discover {
        #[arg(long)]
        urls_file: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        min_delay: Option<f64>,
        #[arg(long)]
        max_delay: Option<f64>,
    },
    /// List recent runs
    Runs {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        registry_db: Option<PathBuf>,
        /// Show per-URL outcomes of one run
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Hash history of one URL across runs
    History {
        url: String,
        #[arg(long)]
        registry_db: Option<PathBuf>,
    },
}

impl Commands {
    fn debug(&self) -> bool {
        matches!(self, Commands::Batch { debug: true, .. })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.command.debug() { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();

    let t0 = Instant::now();
    let settings = Settings::load()?;

    let result = match cli.command {
        Commands::Scrape {
            url,
            output_project,
            output_typologies,
            raw_dir,
        } => {
            let url = util::normalize_url(&url);
            let typologies_path =
                output_typologies.unwrap_or_else(|| typologies_path_for(&output_project));
            let fetcher = http_fetcher(&settings)?;
            let extraction = pipeline::scrape_one(
                &fetcher,
                &url,
                &output_project,
                &typologies_path,
                raw_dir.as_deref(),
            )
            .await?;
            println!(
                "{}: {} typologies ({}) -> {}, {}",
                extraction.project.name.as_deref().unwrap_or("(no name)"),
                extraction.typologies.len(),
                extraction.project.extraction_method.as_str(),
                output_project.display(),
                typologies_path.display()
            );
            Ok(())
        }
        Commands::Batch {
            urls_file,
            out_dir,
            raw_dir,
            registry_db,
            min_delay,
            max_delay,
            debug,
        } => {
            let settings = settings
                .with_registry_db(registry_db)
                .with_delays(min_delay, max_delay)?;
            let urls = util::read_url_list(&urls_file)?;
            if urls.is_empty() {
                bail!("{} contains no URLs", urls_file.display());
            }

            let store = ArtifactStore::new(out_dir, raw_dir);
            store.prepare().with_context(|| {
                format!("Output directory {} is not writable", store.out_dir().display())
            })?;
            let registry = SqliteRegistry::open(&settings.registry_db).with_context(|| {
                format!("Failed to open registry {}", settings.registry_db.display())
            })?;
            let fetcher = http_fetcher(&settings)?;

            println!(
                "Batch: {} URLs -> {} (raw: {}, registry: {})",
                urls.len(),
                store.out_dir().display(),
                store.raw_dir().display(),
                settings.registry_db.display()
            );
            let orchestrator = Orchestrator::new(
                &fetcher,
                &registry,
                &store,
                DelayPolicy::new(settings.min_delay_s, settings.max_delay_s),
                BatchOptions {
                    source: settings.source.clone(),
                    notes: Some(format!("urls_file={}", urls_file.display())),
                    debug,
                    show_progress: std::io::stderr().is_terminal(),
                },
            );
            let summary = orchestrator.run_batch(&urls).await?;
            let c = &summary.counts;
            println!(
                "{}: {} ok ({} new, {} changed, {} unchanged), {} empty, {} failed",
                summary.run_id, c.success, c.first_seen, c.changed, c.unchanged, c.empty, c.failed
            );
            println!("Summary: {}", summary.summary_path.display());
            Ok(())
        }
        Commands::Discover {
            urls_file,
            output,
            min_delay,
            max_delay,
        } => {
            let settings = settings.with_delays(min_delay, max_delay)?;
            let seeds = util::read_url_list(&urls_file)?;
            if seeds.is_empty() {
                bail!("{} contains no URLs", urls_file.display());
            }
            let fetcher = http_fetcher(&settings)?;
            let found = pipeline::discover_related(
                &fetcher,
                &seeds,
                DelayPolicy::new(settings.min_delay_s, settings.max_delay_s),
            )
            .await;

            let mut text = found.iter().map(|p| p.url.as_str()).collect::<Vec<_>>().join("\n");
            if !text.is_empty() {
                text.push('\n');
            }
            store::write_atomic(&output, text.as_bytes())?;
            info!("Discovered {} projects from {} seeds", found.len(), seeds.len());
            println!("Wrote {} URLs to {}", found.len(), output.display());
            Ok(())
        }
        Commands::Runs {
            limit,
            registry_db,
            run_id,
        } => {
            let registry = open_registry(settings.with_registry_db(registry_db))?;
            match run_id {
                Some(id) => print_run_detail(&registry, id)?,
                None => print_runs(&registry, limit)?,
            }
            Ok(())
        }
        Commands::History { url, registry_db } => {
            let registry = open_registry(settings.with_registry_db(registry_db))?;
            let url = util::normalize_url(&url);
            let rows = registry.history(&url)?;
            if rows.is_empty() {
                println!("No history for {}", url);
                return Ok(());
            }
            println!(
                "{:<34} | {:<10} | {:>5} | {:<16} | {}",
                "Run", "Class", "Rows", "Hash", "Recorded"
            );
            println!("{}", "-".repeat(100));
            for r in &rows {
                println!(
                    "{:<34} | {:<10} | {:>5} | {:<16} | {}",
                    truncate(&r.run_id, 34),
                    r.classification.as_str(),
                    r.typology_rows,
                    truncate(&r.content_hash, 13),
                    r.recorded_at
                );
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn http_fetcher(settings: &Settings) -> anyhow::Result<HttpFetcher> {
    HttpFetcher::new(
        &settings.user_agent,
        Duration::from_secs(settings.http_timeout_s),
    )
}

fn open_registry(settings: Settings) -> anyhow::Result<SqliteRegistry> {
    SqliteRegistry::open(&settings.registry_db)
        .with_context(|| format!("Failed to open registry {}", settings.registry_db.display()))
}

fn print_runs(registry: &dyn RunRegistry, limit: usize) -> anyhow::Result<()> {
    let runs = registry.runs(limit)?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    println!(
        "{:<34} | {:<11} | {:<20} | {:>4} | {:>4} | {:>4} | {:>4} | {:>4} | {:>4}",
        "Run", "Status", "Started", "URLs", "New", "Chg", "Same", "Empt", "Fail"
    );
    println!("{}", "-".repeat(115));
    for r in &runs {
        let flag = match r.status {
            RunStatus::Completed => "",
            RunStatus::InProgress => " *",
        };
        println!(
            "{:<34} | {:<11} | {:<20} | {:>4} | {:>4} | {:>4} | {:>4} | {:>4} | {:>4}{}",
            truncate(&r.run_id, 34),
            r.status.as_str(),
            truncate(&r.started_at, 19),
            r.urls_count,
            r.counts.first_seen,
            r.counts.changed,
            r.counts.unchanged,
            r.counts.empty,
            r.counts.failed,
            flag
        );
    }
    if runs.iter().any(|r| r.status == RunStatus::InProgress) {
        println!("\n* never finalized (interrupted or still running)");
    }
    Ok(())
}

fn print_run_detail(registry: &dyn RunRegistry, run_id: String) -> anyhow::Result<()> {
    let run_id = registry::RunId::from(run_id);
    let results = registry.url_results(&run_id)?;
    if results.is_empty() {
        println!("No URL results for {}", run_id);
        return Ok(());
    }
    let entries = registry.entries_for_run(&run_id)?;
    for r in &results {
        println!(
            "{:>3} | {:<15} | {:>6} ms | {}{}",
            r.position + 1,
            r.outcome.label(),
            r.duration_ms,
            r.url,
            r.error.as_deref().map(|e| format!(" ({})", e)).unwrap_or_default()
        );
        if let Some(e) = entries.iter().find(|e| e.url == r.url) {
            println!(
                "    | {} rows ({} ok, {} failed) via {} | hash {} | vs {}",
                e.typology_rows,
                e.parse_ok_rows,
                e.parse_fail_rows,
                e.extraction_method.as_str(),
                truncate(&e.content_hash, 13),
                e.compare_to_run_id.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

/// `out/x__proyecto.json` -> `out/x__tipologias.json`; anything else gets the
/// suffix appended to its stem.
fn typologies_path_for(project: &Path) -> PathBuf {
    let stem = project
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = stem.strip_suffix("__proyecto").unwrap_or(&stem);
    project.with_file_name(format!("{}__tipologias.json", base))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
