//! Shared resources for all fetcher instances
//!
//! Every job must draw from the same token buckets, otherwise concurrent jobs would each get a
//! full burst and exceed the proxy's quota. The HTTP client is shared for connection pooling.

use once_cell::sync::Lazy;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use super::rate_limit::RateLimiter;

/// HTTP connect timeout of the shared client
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default overall request timeout (seconds); requests may override it
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 120;
/// Idle connections kept per host
const HTTP_POOL_MAX_IDLE: usize = 20;

/// Global HTTP client shared by all proxy clients
pub static GLOBAL_HTTP_CLIENT: Lazy<Arc<Client>> = Lazy::new(|| {
    let client = build_http_client(DEFAULT_CONNECT_TIMEOUT).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to build tuned HTTP client, using defaults");
        Client::new()
    });
    Arc::new(client)
});

/// Build a pooled client with the given connect timeout.
pub fn build_http_client(connect_timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
        .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE)
        .build()
}

/// Global limiter with the default channel budgets
pub static GLOBAL_RATE_LIMITER: Lazy<RateLimiter> = Lazy::new(RateLimiter::with_defaults);

/// Get the global HTTP client
pub fn global_http_client() -> Arc<Client> {
    GLOBAL_HTTP_CLIENT.clone()
}

/// Get the global rate limiter. Clones share the same buckets.
pub fn global_rate_limiter() -> RateLimiter {
    GLOBAL_RATE_LIMITER.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_client_is_shared() {
        let client1 = global_http_client();
        let client2 = global_http_client();
        assert!(Arc::ptr_eq(&client1, &client2));
    }

    #[test]
    fn test_global_limiter_has_default_budgets() {
        let limiter = global_rate_limiter();
        assert_eq!(
            limiter.limit(super::super::Channel::KeywordSearch).burst_size,
            5
        );
    }
}
