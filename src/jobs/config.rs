//! Orchestration configuration constants

use crate::fetcher::retry::RetryPolicy;
use crate::fetcher::{Channel, ChannelLimit};
use crate::recovery::RecoveryPolicy;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Pages fetched when the caller does not say otherwise.
pub const DEFAULT_MAX_PAGES: u32 = 5;

/// Hard ceiling on pages per job, whatever the caller asks for.
pub const MAX_PAGES_CEILING: u32 = 20;

/// Attempts per upstream request, including the first.
pub const MAX_REQUEST_ATTEMPTS: u32 = 3;

/// Delay before the second attempt of a request, in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000;

/// Cap on any request backoff, in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Jitter added to request backoff, as a fraction of the delay.
pub const DEFAULT_JITTER_RATIO: f64 = 0.1;

/// Delays before each full-job recovery attempt, in seconds.
pub const RECOVERY_DELAYS_SECS: [u64; 3] = [60, 300, 900];

/// Jobs allowed to fetch pages at the same time.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// Progress events buffered per subscriber before the oldest are dropped.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Longest wait for a rate-limit token within one request attempt.
pub const RATE_LIMIT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress reached once every page is fetched; validation covers the rest.
pub const PAGES_PROGRESS_SHARE: u8 = 90;

/// Progress reported when validation starts.
pub const VALIDATION_STARTED_PROGRESS: u8 = 95;

/// Exponential backoff after failed attempt `attempt` (1-based): `min(cap, base * 2^(attempt-1))`.
pub fn calculate_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(cap)
}

/// Settings for an [`Orchestrator`](super::Orchestrator)
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Request-level retry schedule
    pub retry_policy: RetryPolicy,
    /// Fixed jitter seed for reproducible backoff
    pub jitter_seed: Option<u64>,
    /// Job-level recovery schedule
    pub recovery_policy: RecoveryPolicy,
    /// Per-channel rate limits; missing channels use defaults
    pub channel_limits: HashMap<Channel, ChannelLimit>,
    /// Channel used by single submissions
    pub search_channel: Channel,
    /// Channel used by batch submissions
    pub batch_channel: Channel,
    /// Jobs fetching pages at the same time
    pub worker_concurrency: usize,
    /// Progress events buffered per subscriber
    pub progress_capacity: usize,
    /// Rate-limit wait allowed per request attempt
    pub acquire_timeout: Duration,
    /// Where the dead-letter queue is persisted, if anywhere
    pub dead_letter_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            jitter_seed: None,
            recovery_policy: RecoveryPolicy::default(),
            channel_limits: HashMap::new(),
            search_channel: Channel::KeywordSearch,
            batch_channel: Channel::Batch,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            progress_capacity: PROGRESS_CHANNEL_CAPACITY,
            acquire_timeout: RATE_LIMIT_ACQUIRE_TIMEOUT,
            dead_letter_path: None,
        }
    }
}

impl OrchestratorConfig {
    /// Set the request-level retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Seed the backoff jitter.
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    /// Set the job-level recovery policy.
    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = policy;
        self
    }

    /// Override one channel's rate limit.
    pub fn with_channel_limit(mut self, channel: Channel, limit: ChannelLimit) -> Self {
        self.channel_limits.insert(channel, limit);
        self
    }

    /// Set the channel used by single submissions.
    pub fn with_search_channel(mut self, channel: Channel) -> Self {
        self.search_channel = channel;
        self
    }

    /// Set the channel used by batch submissions.
    pub fn with_batch_channel(mut self, channel: Channel) -> Self {
        self.batch_channel = channel;
        self
    }

    /// Set the worker pool size (at least 1).
    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers.max(1);
        self
    }

    /// Set the progress buffer size (at least 1).
    pub fn with_progress_capacity(mut self, capacity: usize) -> Self {
        self.progress_capacity = capacity.max(1);
        self
    }

    /// Set the rate-limit wait allowed per attempt.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Persist the dead-letter queue at `path`.
    pub fn with_dead_letter_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dead_letter_path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_millis(INITIAL_BACKOFF_MS);
        let cap = Duration::from_millis(MAX_BACKOFF_MS);
        assert_eq!(calculate_backoff(1, base, cap), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, base, cap), Duration::from_secs(2));
        assert_eq!(calculate_backoff(3, base, cap), Duration::from_secs(4));
        assert_eq!(calculate_backoff(6, base, cap), Duration::from_secs(32));
        // Should cap at MAX_BACKOFF_MS
        assert_eq!(calculate_backoff(7, base, cap), cap);
        assert_eq!(calculate_backoff(u32::MAX, base, cap), cap);
    }

    #[test]
    fn test_config_builders_clamp() {
        let config = OrchestratorConfig::default()
            .with_worker_concurrency(0)
            .with_progress_capacity(0);
        assert_eq!(config.worker_concurrency, 1);
        assert_eq!(config.progress_capacity, 1);
        assert_eq!(config.search_channel, Channel::KeywordSearch);
    }
}
