//! Request-level retries with exponential backoff
//!
//! [`RetryEngine::execute`] wraps exactly one upstream operation. Retryable failures are
//! re-attempted after `min(cap, base * 2^(attempt-1))` plus proportional jitter, or after the
//! upstream's `Retry-After` hint for a 429. Fatal failures stop immediately.

use super::{ErrorClass, FetcherError, FetcherResult};
use crate::jobs::config::{
    calculate_backoff, DEFAULT_JITTER_RATIO, INITIAL_BACKOFF_MS, MAX_BACKOFF_MS,
    MAX_REQUEST_ATTEMPTS,
};
use crate::shutdown::CancelSignal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};

/// Outcome of one upstream attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Page was returned
    Success,
    /// Failure worth retrying
    RetryableError,
    /// Failure that stopped the retry loop
    FatalError,
}

/// Record of a single upstream attempt for one page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageFetchAttempt {
    /// Page index (1-based)
    pub page: u32,
    /// Attempt number (1-based)
    pub attempt: u32,
    /// Classified outcome
    pub outcome: AttemptOutcome,
    /// HTTP status, when one was received
    pub http_status: Option<u16>,
    /// Error text for failed attempts
    pub error: Option<String>,
    /// When the attempt finished
    pub at: DateTime<Utc>,
    /// Backoff applied before the next attempt, in milliseconds
    pub delay_before_next_ms: Option<u64>,
}

impl PageFetchAttempt {
    fn success(page: u32, attempt: u32, http_status: u16) -> Self {
        Self {
            page,
            attempt,
            outcome: AttemptOutcome::Success,
            http_status: Some(http_status),
            error: None,
            at: Utc::now(),
            delay_before_next_ms: None,
        }
    }

    fn failure(page: u32, attempt: u32, error: &FetcherError, delay: Option<Duration>) -> Self {
        let outcome = match error.classify() {
            ErrorClass::Retryable => AttemptOutcome::RetryableError,
            ErrorClass::Fatal => AttemptOutcome::FatalError,
        };
        Self {
            page,
            attempt,
            outcome,
            http_status: error.http_status(),
            error: Some(error.to_string()),
            at: Utc::now(),
            delay_before_next_ms: delay.map(|d| d.as_millis() as u64),
        }
    }
}

/// Retry engine errors
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// First non-retryable failure
    #[error("fatal upstream error on page {page}: {error}")]
    Fatal {
        /// Page being fetched
        page: u32,
        /// The fatal error
        error: FetcherError,
        /// Attempt history, ending with the fatal attempt
        attempts: Vec<PageFetchAttempt>,
    },

    /// Every attempt failed with a retryable error
    #[error("page {page} failed after {} attempts: {last_error}", attempts.len())]
    Exhausted {
        /// Page being fetched
        page: u32,
        /// Error of the final attempt
        last_error: FetcherError,
        /// Full attempt history
        attempts: Vec<PageFetchAttempt>,
    },

    /// Cancellation was observed mid-call or during backoff
    #[error("cancelled while fetching page {page}")]
    Cancelled {
        /// Page being fetched
        page: u32,
        /// Attempts made before cancellation
        attempts: Vec<PageFetchAttempt>,
    },
}

impl RetryError {
    /// Attempt history carried by the error.
    pub fn attempts(&self) -> &[PageFetchAttempt] {
        match self {
            RetryError::Fatal { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => attempts,
        }
    }

    /// Consume the error, keeping its attempt history.
    pub fn into_attempts(self) -> Vec<PageFetchAttempt> {
        match self {
            RetryError::Fatal { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => attempts,
        }
    }
}

/// Retry schedule for a single request
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Jitter as a fraction of the computed delay, in `[0, 1]`
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_REQUEST_ATTEMPTS,
            base_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

impl RetryPolicy {
    /// Set total attempts (at least 1).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set base and cap delays.
    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    /// Set the jitter ratio, clamped to `[0, 1]`.
    pub fn with_jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = if jitter_ratio.is_finite() {
            jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Disable jitter.
    pub fn without_jitter(self) -> Self {
        self.with_jitter_ratio(0.0)
    }

    /// Backoff before attempt `attempt + 1`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_delay, self.max_delay)
    }
}

/// Executes one upstream operation under a [`RetryPolicy`]
#[derive(Debug)]
pub struct RetryEngine {
    policy: RetryPolicy,
    rng: Mutex<fastrand::Rng>,
}

impl RetryEngine {
    /// Engine with a randomly seeded jitter source.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Engine whose jitter sequence is reproducible.
    pub fn with_seed(policy: RetryPolicy, seed: u64) -> Self {
        Self {
            policy,
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }

    /// Active policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Jittered delay after failed attempt `attempt` (1-based), never above the cap.
    ///
    /// With `jitter_ratio <= 1` consecutive delays are non-decreasing: the exponential term at
    /// least doubles while jitter adds at most the same ratio, and both are clipped to the cap.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.policy.backoff(attempt);
        if self.policy.jitter_ratio <= 0.0 {
            return delay;
        }
        let sample = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.f64()
        };
        delay
            .mul_f64(1.0 + self.policy.jitter_ratio * sample)
            .min(self.policy.max_delay)
    }

    /// Delay to apply after `error`, honouring a 429 `Retry-After` hint up to the policy cap.
    pub fn delay_for(&self, attempt: u32, error: &FetcherError) -> Duration {
        match error.retry_after() {
            Some(hint) => hint.min(self.policy.max_delay),
            None => self.next_delay(attempt),
        }
    }

    /// Run `operation` until it succeeds, fails fatally, exhausts the policy or is cancelled.
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(
        &self,
        keyword: &str,
        page: u32,
        cancel: &CancelSignal,
        mut operation: F,
    ) -> Result<Retried<T>, RetryError>
    where
        T: Send,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = FetcherResult<(T, u16)>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { page, attempts });
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { page, attempts }),
                result = operation(attempt) => result,
            };

            let error = match result {
                Ok((value, status)) => {
                    attempts.push(PageFetchAttempt::success(page, attempt, status));
                    if attempt > 1 {
                        let ctx = RetryContext::new(
                            attempt,
                            max_attempts,
                            "",
                            Duration::ZERO,
                            keyword,
                            page,
                        );
                        info!("{}", ctx.format_success());
                    }
                    return Ok(Retried { value, attempts });
                }
                Err(error) => error,
            };

            if error.classify() == ErrorClass::Fatal {
                attempts.push(PageFetchAttempt::failure(page, attempt, &error, None));
                error!(
                    keyword = %keyword,
                    page = page,
                    attempt = attempt,
                    error = %error,
                    "Non-retryable upstream error"
                );
                return Err(RetryError::Fatal {
                    page,
                    error,
                    attempts,
                });
            }

            if attempt >= max_attempts {
                attempts.push(PageFetchAttempt::failure(page, attempt, &error, None));
                let ctx = RetryContext::new(
                    attempt,
                    max_attempts,
                    describe(&error),
                    Duration::ZERO,
                    keyword,
                    page,
                )
                .with_error(&error);
                error!("{}", ctx.format_failure());
                return Err(RetryError::Exhausted {
                    page,
                    last_error: error,
                    attempts,
                });
            }

            let delay = self.delay_for(attempt, &error);
            attempts.push(PageFetchAttempt::failure(page, attempt, &error, Some(delay)));
            let ctx = RetryContext::new(
                attempt + 1,
                max_attempts,
                describe(&error),
                delay,
                keyword,
                page,
            );
            warn!(
                keyword = %keyword,
                page = page,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "{}",
                ctx.format_retry()
            );
            crate::metrics::record_retry(delay);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { page, attempts }),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

/// Successful result with the attempts it took
#[derive(Debug)]
pub struct Retried<T> {
    /// Operation result
    pub value: T,
    /// Attempt history, ending with the successful attempt
    pub attempts: Vec<PageFetchAttempt>,
}

/// User-facing description of an error inside retry messages.
pub fn describe(error: &FetcherError) -> String {
    match error {
        FetcherError::TransientNetwork { timeout: true, .. } => "network timeout".to_string(),
        FetcherError::TransientNetwork { .. } => "connection failed".to_string(),
        FetcherError::UpstreamRateLimited { .. } => "rate limit exceeded (429)".to_string(),
        FetcherError::UpstreamStatus { status, .. } => match status {
            500 => "internal server error (500)".to_string(),
            502 => "bad gateway (502)".to_string(),
            503 => "service unavailable (503)".to_string(),
            401 | 403 => format!("authentication failed ({status})"),
            code => format!("HTTP error ({code})"),
        },
        FetcherError::MalformedResponse(_) => "malformed response".to_string(),
        FetcherError::Validation(_) => "invalid request".to_string(),
        FetcherError::RateLimit(_) => "local rate limit wait exceeded".to_string(),
    }
}

/// Remediation hint shown after the retry budget is spent.
pub fn suggestion(error: &FetcherError) -> &'static str {
    match error {
        FetcherError::TransientNetwork { .. } => "Check network connectivity to the proxy service",
        FetcherError::UpstreamRateLimited { .. } | FetcherError::RateLimit(_) => {
            "Lower the channel rate or submit fewer concurrent jobs"
        }
        FetcherError::UpstreamStatus { status, .. } if *status == 401 || *status == 403 => {
            "Verify the proxy username and password"
        }
        FetcherError::UpstreamStatus { .. } => "The proxy may be degraded, try again later",
        FetcherError::MalformedResponse(_) => "The proxy response format may have changed",
        FetcherError::Validation(_) => "Check the keyword and page arguments",
    }
}

/// Context for formatting retry log messages
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt number the message refers to (1-based)
    pub attempt: u32,
    /// Maximum number of attempts configured
    pub max_attempts: u32,
    /// Description of the triggering error
    pub description: String,
    /// Backoff until the next attempt
    pub backoff: Duration,
    /// Search keyword
    pub keyword: String,
    /// Page index
    pub page: u32,
    /// Final error text
    pub error_message: String,
    /// Remediation hint
    pub suggestion: &'static str,
}

impl RetryContext {
    /// Create a context without error details.
    pub fn new(
        attempt: u32,
        max_attempts: u32,
        description: impl Into<String>,
        backoff: Duration,
        keyword: impl Into<String>,
        page: u32,
    ) -> Self {
        Self {
            attempt,
            max_attempts,
            description: description.into(),
            backoff,
            keyword: keyword.into(),
            page,
            error_message: String::new(),
            suggestion: "",
        }
    }

    /// Attach the final error.
    pub fn with_error(mut self, error: &FetcherError) -> Self {
        self.error_message = error.to_string();
        self.suggestion = suggestion(error);
        self
    }

    /// `Retrying (attempt 2/3) after service unavailable (503) - waiting 2.0 seconds... (lamp) page 3`
    pub fn format_retry(&self) -> String {
        format!(
            "Retrying (attempt {}/{}) after {} - waiting {:.1} seconds...{}",
            self.attempt,
            self.max_attempts,
            self.description,
            self.backoff.as_secs_f64(),
            self.target()
        )
    }

    /// Message logged when a retried request eventually succeeds.
    pub fn format_success(&self) -> String {
        format!(
            "Retry attempt {}/{} succeeded - resuming pagination{}",
            self.attempt,
            self.max_attempts,
            self.target()
        )
    }

    /// Multi-line summary logged once the retry budget is spent.
    pub fn format_failure(&self) -> String {
        let keyword = if self.keyword.is_empty() {
            "unknown"
        } else {
            &self.keyword
        };
        let mut lines = vec![
            format!(
                "[FAILED] Page fetch failed after {} attempts",
                self.max_attempts
            ),
            format!("  Last error: {}", self.error_message),
            format!("  Keyword: {keyword}"),
            format!("  Page: {}", self.page),
            "  Suggestions:".to_string(),
        ];
        if !self.suggestion.is_empty() {
            lines.push(format!("    - {}", self.suggestion));
        }
        lines.push(format!(
            "    - Try increasing --max-retries (current: {})",
            self.max_attempts
        ));
        lines.join("\n")
    }

    fn target(&self) -> String {
        if self.keyword.is_empty() {
            format!(" page {}", self.page)
        } else {
            format!(" ({}) page {}", self.keyword, self.page)
        }
    }
}
