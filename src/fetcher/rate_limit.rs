//! Token-bucket rate limiting per upstream channel
//!
//! Each [`Channel`] owns one bucket shared by every job that searches through it. Tokens refill
//! continuously in proportion to elapsed time and are capped at the channel's burst size.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Smallest sleep used while waiting for tokens
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Float slack when comparing token counts
const TOKEN_EPSILON: f64 = 1e-9;

/// Logical upstream channel with its own rate budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// General API traffic
    General,
    /// Single keyword searches
    KeywordSearch,
    /// Searches issued as part of a batch submission
    Batch,
}

impl Channel {
    /// All channels, in declaration order
    pub const ALL: [Channel; 3] = [Channel::General, Channel::KeywordSearch, Channel::Batch];

    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::General => "general",
            Channel::KeywordSearch => "keyword_search",
            Channel::Batch => "batch",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate budget of one channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelLimit {
    /// Tokens added per second
    pub rate_per_second: f64,
    /// Bucket capacity
    pub burst_size: u32,
}

impl ChannelLimit {
    /// Create a limit.
    pub fn new(rate_per_second: f64, burst_size: u32) -> Self {
        Self {
            rate_per_second,
            burst_size,
        }
    }

    /// Operational default for a channel.
    pub fn default_for(channel: Channel) -> Self {
        match channel {
            Channel::General => Self::new(5.0, 10),
            Channel::KeywordSearch => Self::new(2.0, 5),
            Channel::Batch => Self::new(1.0, 3),
        }
    }

    fn validate(&self) -> Result<(), RateLimitError> {
        if !(self.rate_per_second.is_finite() && self.rate_per_second > 0.0) || self.burst_size == 0
        {
            return Err(RateLimitError::InvalidLimit {
                rate_per_second: self.rate_per_second,
                burst_size: self.burst_size,
            });
        }
        Ok(())
    }
}

/// Rate limiter errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    /// Tokens did not become available before the deadline
    #[error("timed out after {waited:?} waiting for {requested} token(s) on {channel}")]
    Timeout {
        /// Channel that was saturated
        channel: Channel,
        /// Tokens requested
        requested: u32,
        /// How long the caller waited
        waited: Duration,
    },

    /// Request can never be satisfied by this bucket
    #[error("requested {requested} tokens but {channel} burst size is {burst_size}")]
    ExceedsBurst {
        /// Channel asked
        channel: Channel,
        /// Tokens requested
        requested: u32,
        /// Bucket capacity
        burst_size: u32,
    },

    /// Limit configuration is unusable
    #[error("invalid channel limit: rate {rate_per_second}/s, burst {burst_size}")]
    InvalidLimit {
        /// Configured rate
        rate_per_second: f64,
        /// Configured burst
        burst_size: u32,
    },
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Continuously refilling token bucket
#[derive(Debug)]
pub struct TokenBucket {
    channel: Channel,
    limit: ChannelLimit,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(channel: Channel, limit: ChannelLimit) -> Result<Self, RateLimitError> {
        limit.validate()?;
        Ok(Self::filled(channel, limit))
    }

    fn filled(channel: Channel, limit: ChannelLimit) -> Self {
        Self {
            channel,
            limit,
            state: Mutex::new(BucketState {
                tokens: f64::from(limit.burst_size),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Configured limit
    pub fn limit(&self) -> ChannelLimit {
        self.limit
    }

    /// Tokens currently available, after refilling.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Wait until `n` tokens can be taken, or fail once `timeout` has elapsed.
    ///
    /// Returns how long the caller waited.
    pub async fn acquire(&self, n: u32, timeout: Duration) -> Result<Duration, RateLimitError> {
        if n > self.limit.burst_size {
            return Err(RateLimitError::ExceedsBurst {
                channel: self.channel,
                requested: n,
                burst_size: self.limit.burst_size,
            });
        }

        let started = Instant::now();
        let deadline = started + timeout;
        let wanted = f64::from(n);

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut state, now);

                if state.tokens + TOKEN_EPSILON >= wanted {
                    state.tokens = (state.tokens - wanted).max(0.0);
                    return Ok(now - started);
                }

                let deficit = wanted - state.tokens;
                Duration::from_secs_f64(deficit / self.limit.rate_per_second).max(MIN_WAIT)
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(RateLimitError::Timeout {
                    channel: self.channel,
                    requested: n,
                    waited: now - started,
                });
            }

            sleep_until((now + wait).min(deadline)).await;
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        let capacity = f64::from(self.limit.burst_size);
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.limit.rate_per_second).min(capacity);
        state.last_refill = now;
    }
}

/// Per-channel rate limiter shared by all jobs
#[derive(Debug, Clone)]
pub struct RateLimiter {
    buckets: Arc<HashMap<Channel, TokenBucket>>,
}

impl RateLimiter {
    /// Limiter using the operational defaults for every channel.
    pub fn with_defaults() -> Self {
        let buckets = Channel::ALL
            .iter()
            .map(|&channel| {
                let bucket = TokenBucket::filled(channel, ChannelLimit::default_for(channel));
                (channel, bucket)
            })
            .collect();
        Self {
            buckets: Arc::new(buckets),
        }
    }

    /// Limiter with explicit limits. Channels missing from `limits` use their defaults.
    pub fn new(limits: &HashMap<Channel, ChannelLimit>) -> Result<Self, RateLimitError> {
        let mut buckets = HashMap::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let limit = limits
                .get(&channel)
                .copied()
                .unwrap_or_else(|| ChannelLimit::default_for(channel));
            buckets.insert(channel, TokenBucket::new(channel, limit)?);
        }
        Ok(Self {
            buckets: Arc::new(buckets),
        })
    }

    /// Acquire `n` tokens on `channel`, waiting at most `timeout`.
    pub async fn acquire(
        &self,
        channel: Channel,
        n: u32,
        timeout: Duration,
    ) -> Result<Duration, RateLimitError> {
        let Some(bucket) = self.buckets.get(&channel) else {
            // Every channel is populated at construction
            return Ok(Duration::ZERO);
        };

        let result = bucket.acquire(n, timeout).await;
        match &result {
            Ok(waited) => {
                if !waited.is_zero() {
                    tracing::debug!(
                        channel = %channel,
                        wait_ms = waited.as_millis() as u64,
                        "Rate limiter delayed request"
                    );
                }
                crate::metrics::record_rate_limit_wait(channel, *waited);
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Rate limit acquisition failed");
            }
        }
        result
    }

    /// Limit configured for `channel`.
    pub fn limit(&self, channel: Channel) -> ChannelLimit {
        self.buckets
            .get(&channel)
            .map(TokenBucket::limit)
            .unwrap_or_else(|| ChannelLimit::default_for(channel))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_defaults()
    }
}
