//! Job orchestrator
//!
//! Composes the rate limiter, retry engine, pagination controller, validator and recovery tier
//! into the job state machine. This is the only component callers talk to.
//!
//! Each submitted job is advanced by its own task. A semaphore bounds how many jobs fetch pages
//! at once; the permit is held for one run and released while a job waits for recovery.

use super::config::{MAX_PAGES_CEILING, VALIDATION_STARTED_PROGRESS};
use super::job::{CancelAck, ErrorDescriptor, ErrorKind, Job, JobId, JobState, JobStatusView};
use super::progress::{page_progress, ProgressBus, ProgressEvent, ProgressKind};
use super::registry::{JobHandle, JobRegistry};
use super::{JobError, OrchestratorConfig};
use crate::fetcher::pagination::{
    flatten_pages, FetchedPage, PaginationController, PaginationOutcome, PartialFailure, StopReason,
};
use crate::fetcher::retry::{PageFetchAttempt, RetryEngine};
use crate::fetcher::{Channel, PageFetcher, RateLimiter};
use crate::metrics::JobMetrics;
use crate::recovery::{
    AttemptRecord, DeadLetterEntry, DeadLetterError, DeadLetterQueue, JobAttempt,
    JobAttemptOutcome,
};
use crate::shutdown::CancelSignal;
use crate::validator::{ResultValidator, ValidationReport};
use crate::ScrapedRecord;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

/// Entry point for submitting and tracking scrape jobs
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    registry: JobRegistry,
    pagination: PaginationController,
    validator: ResultValidator,
    dead_letters: DeadLetterQueue,
    progress: ProgressBus,
    workers: Arc<Semaphore>,
}

/// How a job task ended one run
enum RunEnd {
    /// Terminal state reached
    Done,
    /// Exhausted; wait this long before the next run
    Recover(Duration),
}

impl Orchestrator {
    /// Orchestrator with its own rate limiter built from `config.channel_limits`.
    pub fn new(config: OrchestratorConfig, fetcher: Arc<dyn PageFetcher>) -> Result<Self, JobError> {
        let limiter = RateLimiter::new(&config.channel_limits)?;
        Self::with_rate_limiter(config, fetcher, limiter)
    }

    /// Orchestrator sharing an existing rate limiter.
    pub fn with_rate_limiter(
        config: OrchestratorConfig,
        fetcher: Arc<dyn PageFetcher>,
        limiter: RateLimiter,
    ) -> Result<Self, JobError> {
        let retry = match config.jitter_seed {
            Some(seed) => RetryEngine::with_seed(config.retry_policy.clone(), seed),
            None => RetryEngine::new(config.retry_policy.clone()),
        };
        let pagination = PaginationController::new(fetcher, limiter, Arc::new(retry))
            .with_acquire_timeout(config.acquire_timeout);
        let dead_letters = match &config.dead_letter_path {
            Some(path) => DeadLetterQueue::with_persistence(path)?,
            None => DeadLetterQueue::new(),
        };

        info!(
            workers = config.worker_concurrency,
            recovery_attempts = config.recovery_policy.max_attempts(),
            dead_letters = dead_letters.len(),
            "Orchestrator ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                registry: JobRegistry::new(),
                pagination,
                validator: ResultValidator::new(),
                dead_letters,
                progress: ProgressBus::new(config.progress_capacity),
                workers: Arc::new(Semaphore::new(config.worker_concurrency.max(1))),
                config,
            }),
        })
    }

    /// Queue a keyword search on the search channel.
    pub async fn submit_job(&self, keyword: &str, max_pages: u32) -> Result<JobId, JobError> {
        let channel = self.inner.config.search_channel;
        self.submit_on(keyword, max_pages, channel)
    }

    /// Queue one job per keyword on the batch channel. Each keyword is validated on its own.
    pub async fn submit_batch<I, S>(&self, keywords: I, max_pages: u32) -> Vec<Result<JobId, JobError>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let channel = self.inner.config.batch_channel;
        keywords
            .into_iter()
            .map(|keyword| self.submit_on(keyword.as_ref(), max_pages, channel))
            .collect()
    }

    fn submit_on(&self, keyword: &str, max_pages: u32, channel: Channel) -> Result<JobId, JobError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(JobError::InvalidRequest("keyword must not be empty".to_string()));
        }
        if max_pages == 0 {
            return Err(JobError::InvalidRequest(
                "max_pages must be at least 1".to_string(),
            ));
        }
        let max_pages = if max_pages > MAX_PAGES_CEILING {
            warn!(
                keyword = %keyword,
                requested = max_pages,
                ceiling = MAX_PAGES_CEILING,
                "max_pages above ceiling, clamping"
            );
            MAX_PAGES_CEILING
        } else {
            max_pages
        };

        let handle = self.inner.registry.insert(Job::new(keyword, max_pages, channel));
        let job_id = handle.id();
        info!(job_id = %job_id, keyword = %keyword, max_pages = max_pages, channel = %channel, "Job submitted");
        self.inner.emit(&handle, ProgressKind::Queued);

        let span = tracing::info_span!("job", job_id = %job_id, keyword = %keyword);
        tokio::spawn(run_job(self.inner.clone(), handle).instrument(span));
        Ok(job_id)
    }

    /// Current state, progress, rejection summary and error of a job.
    pub async fn query_state(&self, job_id: JobId) -> Result<JobStatusView, JobError> {
        Ok(self.inner.registry.get(job_id)?.lock().status_view())
    }

    /// Validated records of a `Completed` job, in page order.
    pub async fn fetch_results(&self, job_id: JobId) -> Result<Arc<Vec<ScrapedRecord>>, JobError> {
        let handle = self.inner.registry.get(job_id)?;
        let job = handle.lock();
        match (&job.state, &job.results) {
            (JobState::Completed, Some(results)) => Ok(results.clone()),
            (state, _) => Err(JobError::NotCompleted {
                job_id,
                state: *state,
            }),
        }
    }

    /// Records retained by a cancelled or dead-lettered job.
    pub async fn fetch_partial_results(
        &self,
        job_id: JobId,
    ) -> Result<Arc<Vec<ScrapedRecord>>, JobError> {
        let handle = self.inner.registry.get(job_id)?;
        let job = handle.lock();
        match job.state {
            JobState::Failed | JobState::DeadLettered => {
                Ok(job.results.clone().unwrap_or_default())
            }
            state => Err(JobError::NotCompleted { job_id, state }),
        }
    }

    /// Request cancellation. Takes effect at the job's next suspension point.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<CancelAck, JobError> {
        let handle = self.inner.registry.get(job_id)?;
        let state = handle.current_state();
        if state.is_terminal() {
            debug!(job_id = %job_id, state = %state, "Cancel ignored, job already terminal");
            return Ok(CancelAck {
                job_id,
                accepted: false,
                state,
            });
        }
        if handle.cancel_signal().cancel() {
            info!(job_id = %job_id, state = %state, "Cancellation requested");
        }
        Ok(CancelAck {
            job_id,
            accepted: true,
            state,
        })
    }

    /// Cancel every job that has not reached a terminal state. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let live = self.inner.registry.live();
        let mut signalled = 0;
        for handle in &live {
            if handle.cancel_signal().cancel() {
                signalled += 1;
            }
        }
        if signalled > 0 {
            warn!(jobs = signalled, "Cancelling all live jobs");
        }
        signalled
    }

    /// Dead-letter entries, oldest first.
    pub fn list_dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.inner.dead_letters.list()
    }

    /// Operator removal of a dead-letter entry. Returns whether one existed.
    pub fn remove_dead_letter(&self, job_id: JobId) -> Result<bool, JobError> {
        Ok(self.inner.dead_letters.remove(job_id)?)
    }

    /// Status of every submitted job, oldest first.
    pub fn list_jobs(&self) -> Vec<JobStatusView> {
        self.inner
            .registry
            .list()
            .iter()
            .map(Job::status_view)
            .collect()
    }

    /// Subscribe to progress events of all jobs.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.progress.subscribe()
    }

    /// Resolve once the job reaches a terminal state.
    pub async fn wait_for_terminal(&self, job_id: JobId) -> Result<JobStatusView, JobError> {
        let handle = self.inner.registry.get(job_id)?;
        handle.wait_terminal().await;
        let view = handle.lock().status_view();
        Ok(view)
    }

    /// Configuration in use
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }
}

async fn run_job(inner: Arc<Inner>, handle: Arc<JobHandle>) {
    let cancel = handle.cancel_signal().clone();
    let metrics = JobMetrics::start(handle.lock().channel);
    let mut run: u32 = 1;

    loop {
        match inner.run_once(&handle, &cancel, run, &metrics).await {
            RunEnd::Done => return,
            RunEnd::Recover(delay) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!(run = run, "Cancelled while waiting for recovery");
                        inner.finish_cancelled(&handle, None, Vec::new(), &metrics);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                run += 1;
            }
        }
    }
}

impl Inner {
    /// One full pagination run followed by validation or a recovery decision.
    async fn run_once(
        &self,
        handle: &Arc<JobHandle>,
        cancel: &CancelSignal,
        run: u32,
        metrics: &JobMetrics,
    ) -> RunEnd {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(run = run, "Cancelled before dispatch");
                self.finish_cancelled(handle, None, Vec::new(), metrics);
                return RunEnd::Done;
            }
            permit = self.workers.clone().acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            error!("Worker pool closed");
            self.finish_cancelled(handle, None, Vec::new(), metrics);
            return RunEnd::Done;
        };

        if let Err(e) = handle.transition(JobState::Running) {
            error!(error = %e, "Could not start run");
            return RunEnd::Done;
        }
        let (keyword, max_pages, channel) = {
            let job = handle.lock();
            (job.keyword.clone(), job.max_pages, job.channel)
        };
        info!(run = run, max_pages = max_pages, "Run started");
        self.emit(handle, ProgressKind::Started { run });

        let started_at = Utc::now();
        let outcome = self
            .pagination
            .collect(&keyword, max_pages, channel, cancel, |page| {
                self.on_page(handle, page)
            })
            .await;

        let PaginationOutcome {
            pages,
            stop,
            attempts,
            failure,
        } = outcome;
        let pages_fetched = u32::try_from(pages.len()).unwrap_or(u32::MAX);
        let records = flatten_pages(pages);

        match stop {
            StopReason::Cancelled => {
                let report = self.validator.validate(records);
                self.finish_cancelled(handle, Some(report), attempts, metrics);
                RunEnd::Done
            }
            StopReason::RetryExhausted => {
                let report = self.validator.validate(records);
                let exhausted = Exhaustion {
                    run,
                    started_at,
                    pages_fetched,
                    attempts,
                    failure,
                };
                self.on_exhausted(handle, report, exhausted, metrics)
            }
            StopReason::Fatal | StopReason::NoMorePages | StopReason::EmptyPage
            | StopReason::MaxPagesReached => {
                self.complete(handle, records, stop, attempts, failure, run, metrics);
                RunEnd::Done
            }
        }
    }

    fn on_page(&self, handle: &JobHandle, page: &FetchedPage) {
        let total = {
            let mut job = handle.lock();
            job.pages_fetched += 1;
            job.raw_record_count += page.records.len();
            let progress = page_progress(job.pages_fetched, job.max_pages);
            job.set_progress(progress);
            job.raw_record_count
        };
        self.emit(
            handle,
            ProgressKind::PageFetched {
                page: page.index,
                records: page.records.len(),
                total_records: total,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn complete(
        &self,
        handle: &JobHandle,
        records: Vec<(u32, crate::RawListing)>,
        stop: StopReason,
        attempts: Vec<PageFetchAttempt>,
        failure: Option<PartialFailure>,
        run: u32,
        metrics: &JobMetrics,
    ) {
        handle.lock().set_progress(VALIDATION_STARTED_PROGRESS);
        self.emit(
            handle,
            ProgressKind::ValidationStarted {
                raw_records: records.len(),
            },
        );

        let report = self.validator.validate(records);
        let accepted = report.summary.accepted;
        let rejected = report.summary.rejected();
        handle.lock().set_progress(100);
        self.emit(handle, ProgressKind::ValidationFinished { accepted, rejected });

        let error = failure.map(|failure| {
            warn!(page = failure.page, error = %failure.error, "Completed with partial results after fatal page error");
            ErrorDescriptor {
                kind: ErrorKind::UpstreamFatalError,
                reason: failure.error.to_string(),
                page: Some(failure.page),
                attempt_history: attempts.into_iter().map(AttemptRecord::Request).collect(),
            }
        });

        let ValidationReport { records, summary } = report;
        let transition = handle.transition_with(JobState::Completed, |job| {
            job.results = Some(Arc::new(records));
            job.rejection_summary = Some(summary);
            job.error = error;
        });
        if let Err(e) = transition {
            error!(error = %e, "Could not complete job");
            return;
        }

        if run > 1 {
            if let Err(e) = self.dead_letters.resolve(handle.id()) {
                warn!(error = %e, "Failed to resolve dead-letter entry");
            }
        }

        info!(run = run, stop = ?stop, records = accepted, rejected = rejected, "Job completed");
        metrics.record_completed(accepted);
        self.emit(handle, ProgressKind::Completed { records: accepted });
    }

    fn on_exhausted(
        &self,
        handle: &JobHandle,
        report: ValidationReport,
        exhausted: Exhaustion,
        metrics: &JobMetrics,
    ) -> RunEnd {
        // Recovery attempt that would follow this run
        let recovery_attempt = exhausted.run;
        let delay = self.config.recovery_policy.delay_for(recovery_attempt);
        let retry_at = delay.and_then(|d| chrono::Duration::from_std(d).ok().map(|d| Utc::now() + d));
        let reason = exhausted.reason();
        let page = exhausted.failure.as_ref().map(|f| f.page);

        warn!(
            run = exhausted.run,
            page = ?page,
            pages_kept = exhausted.pages_fetched,
            reason = %reason,
            "Run exhausted request retries"
        );

        let run_history: Vec<AttemptRecord> = exhausted
            .attempts
            .iter()
            .cloned()
            .map(AttemptRecord::Request)
            .collect();
        self.record_exhaustion(handle, &exhausted, &reason, retry_at);

        let ValidationReport { records, summary } = report;
        let recovering = handle.transition_with(JobState::Recovering, |job| {
            job.results = Some(Arc::new(records));
            job.rejection_summary = Some(summary);
            job.error = Some(ErrorDescriptor {
                kind: ErrorKind::JobRetryExhausted,
                reason: reason.clone(),
                page,
                attempt_history: run_history,
            });
            if delay.is_some() {
                job.recovery_attempts = recovery_attempt;
            }
        });
        if let Err(e) = recovering {
            error!(error = %e, "Could not enter recovery");
            return RunEnd::Done;
        }

        match (delay, retry_at) {
            (Some(delay), Some(retry_at)) => {
                info!(
                    attempt = recovery_attempt,
                    delay_secs = delay.as_secs(),
                    retry_at = %retry_at,
                    "Recovery scheduled"
                );
                self.emit(
                    handle,
                    ProgressKind::Recovering {
                        attempt: recovery_attempt,
                        retry_at,
                    },
                );
                RunEnd::Recover(delay)
            }
            _ => {
                self.dead_letter(handle, reason, page, metrics);
                RunEnd::Done
            }
        }
    }

    /// Open the dead-letter entry on the first exhaustion, append a job-level record afterwards.
    fn record_exhaustion(
        &self,
        handle: &JobHandle,
        exhausted: &Exhaustion,
        reason: &str,
        retry_at: Option<DateTime<Utc>>,
    ) {
        let job_id = handle.id();
        let result = if exhausted.run == 1 {
            let (keyword, max_pages) = {
                let job = handle.lock();
                (job.keyword.clone(), job.max_pages)
            };
            self.dead_letters.open(DeadLetterEntry::new(
                job_id,
                keyword,
                max_pages,
                reason,
                exhausted.attempts.clone(),
                retry_at,
            ))
        } else {
            let attempt = JobAttempt {
                recovery_attempt: exhausted.run - 1,
                started_at: exhausted.started_at,
                finished_at: Utc::now(),
                outcome: JobAttemptOutcome::RetryExhausted,
                pages_fetched: exhausted.pages_fetched,
                request_attempts: u32::try_from(exhausted.attempts.len()).unwrap_or(u32::MAX),
                error: Some(reason.to_string()),
            };
            self.dead_letters.record_job_attempt(job_id, attempt, retry_at)
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to update dead-letter queue");
        }
    }

    fn dead_letter(&self, handle: &JobHandle, reason: String, page: Option<u32>, metrics: &JobMetrics) {
        let job_id = handle.id();
        if let Err(e) = self.dead_letters.park(job_id, reason.clone()) {
            warn!(error = %e, "Failed to park dead-letter entry");
        }
        let history = self
            .dead_letters
            .get(job_id)
            .map(|entry| entry.attempts)
            .unwrap_or_default();
        let attempts = history.len();

        let transition = handle.transition_with(JobState::DeadLettered, |job| {
            job.error = Some(ErrorDescriptor {
                kind: ErrorKind::JobRecoveryExhausted,
                reason,
                page,
                attempt_history: history,
            });
        });
        if let Err(e) = transition {
            error!(error = %e, "Could not dead-letter job");
            return;
        }

        error!(attempts = attempts, "Recovery schedule exhausted, job dead-lettered");
        metrics.record_dead_lettered();
        self.emit(handle, ProgressKind::DeadLettered { attempts });
    }

    /// Move to `Failed`. A `report` replaces the retained results; `None` keeps what is there.
    fn finish_cancelled(
        &self,
        handle: &JobHandle,
        report: Option<ValidationReport>,
        attempts: Vec<PageFetchAttempt>,
        metrics: &JobMetrics,
    ) {
        let job_id = handle.id();
        let reason = "cancelled".to_string();
        let transition = handle.transition_with(JobState::Failed, |job| {
            if let Some(ValidationReport { records, summary }) = report {
                job.results = Some(Arc::new(records));
                job.rejection_summary = Some(summary);
            }
            job.error = Some(ErrorDescriptor {
                kind: ErrorKind::Cancelled,
                reason: reason.clone(),
                page: None,
                attempt_history: attempts.into_iter().map(AttemptRecord::Request).collect(),
            });
        });
        if let Err(e) = transition {
            debug!(error = %e, "Cancellation arrived after job finished");
            return;
        }

        // No further automatic attempts for a cancelled job
        match self.dead_letters.park(job_id, "cancelled during recovery") {
            Ok(()) | Err(DeadLetterError::NotFound(_)) => {}
            Err(e) => warn!(error = %e, "Failed to park dead-letter entry"),
        }

        let kept = handle
            .lock()
            .results
            .as_ref()
            .map(|r| r.len())
            .unwrap_or(0);
        info!(records_kept = kept, "Job cancelled");
        metrics.record_cancelled();
        self.emit(handle, ProgressKind::Failed { reason });
    }

    fn emit(&self, handle: &JobHandle, kind: ProgressKind) {
        let (state, progress) = {
            let job = handle.lock();
            (job.state, job.progress)
        };
        self.progress
            .publish(ProgressEvent::new(handle.id(), state, progress, kind));
    }
}

/// What a retry-exhausted run leaves behind
struct Exhaustion {
    run: u32,
    started_at: DateTime<Utc>,
    pages_fetched: u32,
    attempts: Vec<PageFetchAttempt>,
    failure: Option<PartialFailure>,
}

impl Exhaustion {
    fn reason(&self) -> String {
        match &self.failure {
            Some(failure) => format!(
                "page {} exhausted retries: {}",
                failure.page, failure.error
            ),
            None => "request retries exhausted".to_string(),
        }
    }
}
