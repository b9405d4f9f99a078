//! Upstream page fetching
//!
//! The [`PageFetcher`] trait is the only call subject to rate limiting and retries. The
//! submodules layer those concerns on top of it:
//!
//! - [`rate_limit`] - per-channel token buckets
//! - [`retry`] - outcome classification and exponential backoff
//! - [`pagination`] - sequential multi-page retrieval
//! - [`proxy_http`] - the reqwest implementation talking to the scraping proxy

use crate::RawListing;
use async_trait::async_trait;
use std::time::Duration;

pub mod pagination;
pub mod proxy_http;
pub mod rate_limit;
pub mod retry;
pub mod shared_resources;

pub use rate_limit::{Channel, ChannelLimit, RateLimitError, RateLimiter};

/// Fetcher errors (request-level taxonomy)
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetcherError {
    /// Connection failure or timeout
    #[error("transient network error: {message}")]
    TransientNetwork {
        /// Underlying error text
        message: String,
        /// Whether the failure was a timeout
        timeout: bool,
    },

    /// Upstream answered 429
    #[error("upstream rate limited (retry after {retry_after:?})")]
    UpstreamRateLimited {
        /// `Retry-After` hint, if the response carried one
        retry_after: Option<Duration>,
    },

    /// Upstream answered with an error status
    #[error("upstream HTTP {status}: {message}")]
    UpstreamStatus {
        /// HTTP status code
        status: u16,
        /// Response body or reason phrase
        message: String,
    },

    /// Response could not be decoded
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Request parameters were rejected before sending
    #[error("validation error: {0}")]
    Validation(String),

    /// The local token bucket could not provide a permit in time
    #[error("rate limit acquisition failed: {0}")]
    RateLimit(#[from] RateLimitError),
}

/// Request-level classification of a failed upstream call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another attempt after a backoff
    Retryable,
    /// Retrying cannot help
    Fatal,
}

impl FetcherError {
    /// Classify the error for the retry engine.
    pub fn classify(&self) -> ErrorClass {
        match self {
            FetcherError::TransientNetwork { .. } | FetcherError::UpstreamRateLimited { .. } => {
                ErrorClass::Retryable
            }
            FetcherError::UpstreamStatus { status, .. } => match status {
                429 | 500 | 502 | 503 => ErrorClass::Retryable,
                _ => ErrorClass::Fatal,
            },
            FetcherError::RateLimit(RateLimitError::Timeout { .. }) => ErrorClass::Retryable,
            FetcherError::RateLimit(_)
            | FetcherError::MalformedResponse(_)
            | FetcherError::Validation(_) => ErrorClass::Fatal,
        }
    }

    /// `Retry-After` hint carried by a 429 response.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetcherError::UpstreamRateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status associated with the error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            FetcherError::UpstreamRateLimited { .. } => Some(429),
            FetcherError::UpstreamStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type for fetcher operations
pub type FetcherResult<T> = Result<T, FetcherError>;

/// Explicit continuation information carried by an upstream page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationSignal {
    /// Upstream reported the total number of result pages
    TotalPages(u32),
    /// Upstream reported whether a next-page cursor exists
    HasMore(bool),
}

impl ContinuationSignal {
    /// Whether more pages remain after `page` (1-based).
    pub fn has_more_after(&self, page: u32) -> bool {
        match self {
            ContinuationSignal::TotalPages(total) => page < *total,
            ContinuationSignal::HasMore(more) => *more,
        }
    }
}

/// One page of search results
#[derive(Debug, Clone, Default)]
pub struct PageResponse {
    /// Listings on the page, in upstream order
    pub records: Vec<RawListing>,
    /// Explicit continuation signal, when the upstream provides one
    pub continuation: Option<ContinuationSignal>,
    /// HTTP status of the successful response
    pub http_status: u16,
}

impl PageResponse {
    /// Successful page with no explicit continuation signal.
    pub fn new(records: Vec<RawListing>) -> Self {
        Self {
            records,
            continuation: None,
            http_status: 200,
        }
    }

    /// Attach an explicit continuation signal.
    pub fn with_continuation(mut self, signal: ContinuationSignal) -> Self {
        self.continuation = Some(signal);
        self
    }
}

/// Upstream collaborator that returns one page of keyword search results
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch result page `page_index` (1-based) for `keyword`.
    async fn fetch_page(
        &self,
        keyword: &str,
        page_index: u32,
        channel: Channel,
    ) -> FetcherResult<PageResponse>;

    /// Short name used in logs and metrics
    fn name(&self) -> &str {
        "upstream"
    }
}
