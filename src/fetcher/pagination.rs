//! Sequential page retrieval for one keyword search
//!
//! Pages are requested strictly in order through the rate limiter and retry engine. Fetching
//! stops when:
//! - the upstream's explicit continuation signal says no pages remain
//! - a page yields zero records (also used when no explicit signal is present)
//! - the max-pages bound is reached (never more than [`MAX_PAGES_CEILING`])
//! - a page fails fatally, exhausts its retries, or the job is cancelled
//!
//! Pages retrieved before a failure are always returned.

use super::rate_limit::{Channel, RateLimiter};
use super::retry::{PageFetchAttempt, RetryEngine, RetryError};
use super::{FetcherError, PageFetcher};
use crate::jobs::config::{MAX_PAGES_CEILING, RATE_LIMIT_ACQUIRE_TIMEOUT};
use crate::shutdown::CancelSignal;
use crate::RawListing;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why pagination ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Continuation signal reported no further pages
    NoMorePages,
    /// A page came back with zero records
    EmptyPage,
    /// The max-pages bound was reached
    MaxPagesReached,
    /// A page exhausted its request-level retries
    RetryExhausted,
    /// A page failed with a non-retryable error
    Fatal,
    /// Cancellation was observed
    Cancelled,
}

impl StopReason {
    /// Whether pagination ended normally
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            StopReason::NoMorePages | StopReason::EmptyPage | StopReason::MaxPagesReached
        )
    }
}

/// A page with at least one record
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Page index (1-based)
    pub index: u32,
    /// Records in upstream order
    pub records: Vec<RawListing>,
}

/// Failure that ended pagination early
#[derive(Debug, Clone)]
pub struct PartialFailure {
    /// Page that failed
    pub page: u32,
    /// Error of the last attempt
    pub error: FetcherError,
}

/// Result of a pagination run
#[derive(Debug)]
pub struct PaginationOutcome {
    /// Pages retrieved, in order
    pub pages: Vec<FetchedPage>,
    /// Why fetching stopped
    pub stop: StopReason,
    /// Every upstream attempt made during the run
    pub attempts: Vec<PageFetchAttempt>,
    /// Set when a page failed (exhausted or fatal)
    pub failure: Option<PartialFailure>,
}

impl PaginationOutcome {
    /// Total raw records across pages
    pub fn record_count(&self) -> usize {
        self.pages.iter().map(|p| p.records.len()).sum()
    }

    /// Flatten into `(page, record)` pairs in page order.
    pub fn into_records(self) -> Vec<(u32, RawListing)> {
        flatten_pages(self.pages)
    }
}

/// Flatten pages into `(page, record)` pairs, keeping page order.
pub fn flatten_pages(pages: Vec<FetchedPage>) -> Vec<(u32, RawListing)> {
    pages
        .into_iter()
        .flat_map(|page| {
            let index = page.index;
            page.records.into_iter().map(move |r| (index, r))
        })
        .collect()
}

/// Drives sequential multi-page retrieval
pub struct PaginationController {
    fetcher: Arc<dyn PageFetcher>,
    limiter: RateLimiter,
    retry: Arc<RetryEngine>,
    acquire_timeout: Duration,
}

impl PaginationController {
    /// Create a controller sharing the given limiter and retry engine.
    pub fn new(fetcher: Arc<dyn PageFetcher>, limiter: RateLimiter, retry: Arc<RetryEngine>) -> Self {
        Self {
            fetcher,
            limiter,
            retry,
            acquire_timeout: RATE_LIMIT_ACQUIRE_TIMEOUT,
        }
    }

    /// Set how long one attempt may wait for a rate-limit token.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Fetch up to `max_pages` pages for `keyword`, calling `on_page` after each non-empty page.
    pub async fn collect<F>(
        &self,
        keyword: &str,
        max_pages: u32,
        channel: Channel,
        cancel: &CancelSignal,
        mut on_page: F,
    ) -> PaginationOutcome
    where
        F: FnMut(&FetchedPage),
    {
        let max_pages = max_pages.clamp(1, MAX_PAGES_CEILING);
        let mut pages = Vec::new();
        let mut attempts = Vec::new();
        let fetcher = &self.fetcher;
        let limiter = &self.limiter;
        let acquire_timeout = self.acquire_timeout;

        let finish = |pages: Vec<FetchedPage>,
                      stop: StopReason,
                      attempts: Vec<PageFetchAttempt>,
                      failure: Option<PartialFailure>| PaginationOutcome {
            pages,
            stop,
            attempts,
            failure,
        };

        for page in 1..=max_pages {
            if cancel.is_cancelled() {
                info!(keyword = %keyword, page = page, "Cancellation observed between pages");
                return finish(pages, StopReason::Cancelled, attempts, None);
            }

            debug!(keyword = %keyword, page = page, channel = %channel, "Fetching page");

            let result = self
                .retry
                .execute(keyword, page, cancel, |_| async move {
                    limiter.acquire(channel, 1, acquire_timeout).await?;
                    let response = fetcher.fetch_page(keyword, page, channel).await;
                    let status = match &response {
                        Ok(r) => Some(r.http_status),
                        Err(e) => e.http_status(),
                    };
                    crate::metrics::record_upstream_request(channel, status);
                    let response = response?;
                    let status = response.http_status;
                    Ok::<_, FetcherError>((response, status))
                })
                .await;

            let response = match result {
                Ok(retried) => {
                    attempts.extend(retried.attempts);
                    retried.value
                }
                Err(err) => {
                    let (stop, failure) = match &err {
                        RetryError::Exhausted { last_error, .. } => (
                            StopReason::RetryExhausted,
                            Some(PartialFailure {
                                page,
                                error: last_error.clone(),
                            }),
                        ),
                        RetryError::Fatal { error, .. } => (
                            StopReason::Fatal,
                            Some(PartialFailure {
                                page,
                                error: error.clone(),
                            }),
                        ),
                        RetryError::Cancelled { .. } => (StopReason::Cancelled, None),
                    };
                    warn!(
                        keyword = %keyword,
                        page = page,
                        pages_kept = pages.len(),
                        error = %err,
                        "Pagination stopped early"
                    );
                    attempts.extend(err.into_attempts());
                    return finish(pages, stop, attempts, failure);
                }
            };

            if response.records.is_empty() {
                debug!(keyword = %keyword, page = page, "Empty page, no more results");
                return finish(pages, StopReason::EmptyPage, attempts, None);
            }

            let continuation = response.continuation;
            let fetched = FetchedPage {
                index: page,
                records: response.records,
            };
            debug!(
                keyword = %keyword,
                page = page,
                records = fetched.records.len(),
                "Page fetched"
            );
            on_page(&fetched);
            pages.push(fetched);

            if let Some(signal) = continuation {
                if !signal.has_more_after(page) {
                    debug!(keyword = %keyword, page = page, "Upstream reports no more pages");
                    return finish(pages, StopReason::NoMorePages, attempts, None);
                }
            }
        }

        finish(pages, StopReason::MaxPagesReached, attempts, None)
    }
}
