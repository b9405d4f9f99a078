//! Scrape and batch command implementation

use crate::fetcher::proxy_http::{ProxyConfig, ProxyHttpClient, DEFAULT_PROXY_URL};
use crate::fetcher::retry::RetryPolicy;
use crate::fetcher::shared_resources::global_rate_limiter;
use crate::jobs::config::{DEFAULT_MAX_PAGES, DEFAULT_WORKER_CONCURRENCY, MAX_REQUEST_ATTEMPTS};
use crate::jobs::{JobId, JobState, JobStatusView, Orchestrator, OrchestratorConfig, ProgressEvent};
use crate::output::{
    clean_keyword, write_json_report, CsvListingWriter, JsonReport, ListingWriter, OutputFormat as FileFormat,
    OutputPathBuilder, OutputWriter,
};
use crate::recovery::RecoveryPolicy;
use crate::shutdown::SharedCancel;
use crate::ScrapedRecord;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tracing::{error, info, warn};

use super::CliError;

/// Maximum allowed worker pool size
const MAX_CONCURRENCY: usize = 32;

/// Parse and validate concurrency value
fn parse_concurrency(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("concurrency must be at least 1".to_string());
    }
    if value > MAX_CONCURRENCY {
        return Err(format!(
            "concurrency {value} exceeds maximum of {MAX_CONCURRENCY}"
        ));
    }
    Ok(value)
}

/// Listing Scraper CLI
#[derive(Parser, Debug)]
#[command(name = "listing-scraper")]
#[command(about = "Scrape product listings by keyword through a scraping proxy", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,

    /// Scraping proxy endpoint
    #[arg(long, global = true, env = "PROXY_BASE_URL", default_value = DEFAULT_PROXY_URL)]
    pub proxy_url: String,

    /// Scraping proxy user
    #[arg(long, global = true, env = "PROXY_USERNAME", hide_env_values = true)]
    pub proxy_username: Option<String>,

    /// Scraping proxy password
    #[arg(long, global = true, env = "PROXY_PASSWORD", hide_env_values = true)]
    pub proxy_password: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, global = true, env = "API_TIMEOUT", default_value = "120")]
    pub timeout: u64,

    /// Connect timeout in seconds
    #[arg(long, global = true, env = "API_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// Retries per upstream request after the first attempt (range: 0-19)
    #[arg(long, global = true, env = "API_MAX_RETRIES", default_value_t = MAX_REQUEST_ATTEMPTS - 1, value_parser = clap::value_parser!(u32).range(0..=19))]
    pub max_retries: u32,

    /// Jobs fetching pages at the same time (max: 32)
    #[arg(long, global = true, default_value_t = DEFAULT_WORKER_CONCURRENCY, value_parser = parse_concurrency)]
    pub concurrency: usize,

    /// Directory for result files
    #[arg(long, global = true, default_value = "outputs")]
    pub output_dir: PathBuf,

    /// Persist the dead-letter queue in this file
    #[arg(long, global = true)]
    pub dead_letter_file: Option<PathBuf>,

    /// Skip job-level recovery; dead-letter as soon as request retries are exhausted
    #[arg(long, global = true, default_value_t = false)]
    pub no_recovery: bool,

    /// Serve Prometheus metrics on this address (e.g. 0.0.0.0:9090)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Proxy settings from flags or environment.
    pub fn proxy_config(&self) -> Result<ProxyConfig, CliError> {
        let (Some(username), Some(password)) = (&self.proxy_username, &self.proxy_password) else {
            return Err(CliError::ConfigurationError(
                "proxy credentials missing: set PROXY_USERNAME and PROXY_PASSWORD".to_string(),
            ));
        };
        Ok(ProxyConfig::new(&self.proxy_url, username, password)
            .with_timeout(Duration::from_secs(self.timeout.max(1)))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout.max(1))))
    }

    /// Attempts per upstream request: the first one plus `--max-retries`.
    pub fn request_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Orchestrator settings derived from the flags.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default()
            .with_retry_policy(RetryPolicy::default().with_max_attempts(self.request_attempts()))
            .with_worker_concurrency(self.concurrency);
        if let Some(path) = &self.dead_letter_file {
            config = config.with_dead_letter_path(path);
        }
        if self.no_recovery {
            config = config.with_recovery_policy(RecoveryPolicy::new(Vec::new()));
        }
        config
    }

    /// Orchestrator on the proxy client and the process-wide rate limiter.
    pub fn build_orchestrator(&self) -> Result<Orchestrator, CliError> {
        let fetcher = Arc::new(ProxyHttpClient::new(self.proxy_config()?)?);
        Ok(Orchestrator::with_rate_limiter(
            self.orchestrator_config(),
            fetcher,
            global_rate_limiter(),
        )?)
    }
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scrape listings for one keyword
    Scrape(ScrapeArgs),

    /// Scrape listings for several keywords
    Batch(BatchArgs),

    /// Inspect or remove dead-lettered jobs
    DeadLetters(super::DeadLettersCommand),
}

/// Arguments for a single keyword search
#[derive(Parser, Debug)]
pub struct ScrapeArgs {
    /// Search keyword
    pub keyword: String,

    /// Result pages to fetch (1-20)
    #[arg(long, default_value_t = DEFAULT_MAX_PAGES)]
    pub max_pages: u32,

    /// Result file format
    #[arg(long, default_value = "csv")]
    pub format: ResultFormat,
}

/// Arguments for a batch of keyword searches
#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// Search keywords
    pub keywords: Vec<String>,

    /// File with one keyword per line (blank lines and `#` comments ignored)
    #[arg(long)]
    pub keywords_file: Option<PathBuf>,

    /// Result pages to fetch per keyword (1-20)
    #[arg(long, default_value_t = DEFAULT_MAX_PAGES)]
    pub max_pages: u32,

    /// Result file format
    #[arg(long, default_value = "csv")]
    pub format: ResultFormat,
}

/// Output format options
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}

/// Result file format
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum ResultFormat {
    /// Marketplace CSV layout
    Csv,
    /// JSON report including the rejection summary
    Json,
}

impl From<ResultFormat> for FileFormat {
    fn from(format: ResultFormat) -> Self {
        match format {
            ResultFormat::Csv => FileFormat::Csv,
            ResultFormat::Json => FileFormat::Json,
        }
    }
}

impl ScrapeArgs {
    /// Run one search to completion and write its results.
    pub async fn execute(&self, cli: &Cli, shutdown: SharedCancel) -> Result<(), CliError> {
        let orchestrator = cli.build_orchestrator()?;
        let events = orchestrator.subscribe();
        let job_id = orchestrator.submit_job(&self.keyword, self.max_pages).await?;

        let statuses = track_jobs(&orchestrator, vec![job_id], events, shutdown).await?;
        finish_jobs(&orchestrator, cli, statuses, self.format).await
    }
}

impl BatchArgs {
    /// Run every keyword and write one result file per job.
    pub async fn execute(&self, cli: &Cli, shutdown: SharedCancel) -> Result<(), CliError> {
        let keywords = self.collect_keywords()?;
        if keywords.is_empty() {
            return Err(CliError::InvalidArgument(
                "no keywords given; pass them as arguments or with --keywords-file".to_string(),
            ));
        }

        let orchestrator = cli.build_orchestrator()?;
        let events = orchestrator.subscribe();
        let mut job_ids = Vec::with_capacity(keywords.len());
        for (keyword, submitted) in keywords
            .iter()
            .zip(orchestrator.submit_batch(&keywords, self.max_pages).await)
        {
            match submitted {
                Ok(job_id) => job_ids.push(job_id),
                Err(e) => warn!(keyword = %keyword, error = %e, "Keyword rejected"),
            }
        }
        info!(jobs = job_ids.len(), "Batch submitted");

        let statuses = track_jobs(&orchestrator, job_ids, events, shutdown).await?;
        finish_jobs(&orchestrator, cli, statuses, self.format).await
    }

    fn collect_keywords(&self) -> Result<Vec<String>, CliError> {
        let mut keywords = self.keywords.clone();
        if let Some(path) = &self.keywords_file {
            let content = std::fs::read_to_string(path).map_err(|e| {
                CliError::InvalidArgument(format!("Failed to read {}: {e}", path.display()))
            })?;
            keywords.extend(parse_keyword_lines(&content));
        }
        Ok(dedup_keywords(keywords))
    }
}

/// Keywords from a file, one per line.
pub fn parse_keyword_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Drop keywords whose result file would collide with an earlier keyword's.
pub fn dedup_keywords(keywords: Vec<String>) -> Vec<String> {
    let mut stems = HashSet::new();
    keywords
        .into_iter()
        .filter(|keyword| {
            let fresh = stems.insert(clean_keyword(keyword));
            if !fresh {
                warn!(keyword = %keyword, "Skipping duplicate keyword");
            }
            fresh
        })
        .collect()
}

/// Wait for every job, drawing progress and cancelling on shutdown.
async fn track_jobs(
    orchestrator: &Orchestrator,
    job_ids: Vec<JobId>,
    events: Receiver<ProgressEvent>,
    shutdown: SharedCancel,
) -> Result<Vec<JobStatusView>, CliError> {
    let progress = create_progress_bar(job_ids.len());

    let watcher = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            shutdown.cancelled().await;
            warn!("Shutdown requested - cancelling jobs...");
            orchestrator.cancel_all();
        }
    });
    let drawer = tokio::spawn(draw_progress(progress.clone(), job_ids.clone(), events));

    let statuses = join_all(job_ids.iter().map(|id| orchestrator.wait_for_terminal(*id))).await;

    watcher.abort();
    drawer.abort();
    progress.finish_and_clear();
    Ok(statuses.into_iter().collect::<Result<Vec<_>, _>>()?)
}

async fn draw_progress(progress: ProgressBar, job_ids: Vec<JobId>, mut events: Receiver<ProgressEvent>) {
    let mut per_job: HashMap<JobId, u8> = job_ids.iter().map(|id| (*id, 0)).collect();
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(slot) = per_job.get_mut(&event.job_id) else {
                    continue;
                };
                *slot = event.progress;
                let position: u64 = per_job.values().map(|p| u64::from(*p)).sum();
                progress.set_position(position);
                progress.set_message(event.to_string());
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Progress display fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Create progress bar with style
fn create_progress_bar(jobs: usize) -> ProgressBar {
    let pb = ProgressBar::new(100 * jobs as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message(format!("Scraping {jobs} keyword(s)"));
    pb
}

/// Write result files, print the summary and fail if any job did not complete.
async fn finish_jobs(
    orchestrator: &Orchestrator,
    cli: &Cli,
    statuses: Vec<JobStatusView>,
    format: ResultFormat,
) -> Result<(), CliError> {
    let mut first_failure = None;
    let mut summaries = Vec::with_capacity(statuses.len());

    for status in statuses {
        let records = match status.state {
            JobState::Completed => orchestrator.fetch_results(status.job_id).await?,
            _ => orchestrator.fetch_partial_results(status.job_id).await?,
        };

        let output_path = if status.state == JobState::Completed || !records.is_empty() {
            Some(write_results(&cli.output_dir, &status, &records, format)?)
        } else {
            None
        };

        if status.state != JobState::Completed && first_failure.is_none() {
            first_failure = Some(CliError::JobFailed {
                job_id: status.job_id,
                state: status.state,
                reason: status
                    .error
                    .as_ref()
                    .map(|e| e.reason.clone())
                    .unwrap_or_else(|| status.state.to_string()),
            });
        }
        summaries.push((status, records.len(), output_path));
    }

    match cli.output_format {
        OutputFormat::Json => output_json(&summaries),
        OutputFormat::Human => output_human(&summaries),
    }

    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn write_results(
    output_dir: &Path,
    status: &JobStatusView,
    records: &[ScrapedRecord],
    format: ResultFormat,
) -> Result<PathBuf, CliError> {
    let path = OutputPathBuilder::new(output_dir.to_path_buf(), &status.keyword)
        .with_format(format.into())
        .build()?;

    match format {
        ResultFormat::Csv => {
            let mut writer = CsvListingWriter::new(&path)?;
            writer.write_records(records)?;
            writer.close()?;
        }
        ResultFormat::Json => {
            let report = JsonReport::new(
                status.job_id,
                &status.keyword,
                status.state,
                records.to_vec(),
                status.rejection_summary.clone(),
            );
            write_json_report(&path, &report)?;
        }
    }
    Ok(path)
}

type JobSummary = (JobStatusView, usize, Option<PathBuf>);

/// Output result as JSON
fn output_json(summaries: &[JobSummary]) {
    let jobs: Vec<serde_json::Value> = summaries
        .iter()
        .map(|(status, records, path)| {
            serde_json::json!({
                "success": status.state == JobState::Completed,
                "job_id": status.job_id,
                "keyword": status.keyword,
                "state": status.state,
                "pages_fetched": status.pages_fetched,
                "records": records,
                "rejection_summary": status.rejection_summary,
                "recovery_attempts": status.recovery_attempts,
                "output_path": path.as_ref().map(|p| p.display().to_string()),
                "error": status.error,
            })
        })
        .collect();

    match serde_json::to_string(&jobs) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("Failed to serialize summary: {}", e),
    }
}

/// Output result in human-readable format
fn output_human(summaries: &[JobSummary]) {
    for (status, records, path) in summaries {
        if status.state == JobState::Completed {
            println!("\nScrape of '{}' completed successfully!", status.keyword);
        } else {
            eprintln!("\nScrape of '{}' ended as {}!", status.keyword, status.state);
        }
        println!("Job: {}", status.job_id);
        println!("Pages fetched: {}", status.pages_fetched);
        println!("Listings: {records}");
        if let Some(summary) = &status.rejection_summary {
            if summary.rejected() > 0 {
                println!(
                    "Dropped: {} (missing field {}, duplicate {}, invalid field {})",
                    summary.rejected(),
                    summary.missing_field,
                    summary.duplicate,
                    summary.invalid_field
                );
            }
        }
        if let Some(path) = path {
            println!("Output: {}", path.display());
        }
        if let Some(error) = &status.error {
            eprintln!("Error: {}", error.reason);
        }
    }
}
