//! Token-bucket timing under contention

use listing_scraper::fetcher::{Channel, ChannelLimit, RateLimitError, RateLimiter};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

fn limiter(channel: Channel, rate: f64, burst: u32) -> RateLimiter {
    let mut limits = HashMap::new();
    limits.insert(channel, ChannelLimit::new(rate, burst));
    RateLimiter::new(&limits).unwrap()
}

/// Spawn `n` simultaneous single-token acquisitions and return when each finished.
async fn acquire_concurrently(limiter: &RateLimiter, channel: Channel, n: usize) -> Vec<Instant> {
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .acquire(channel, 1, Duration::from_secs(60))
                    .await
                    .unwrap();
                Instant::now()
            })
        })
        .collect();

    let mut finished = Vec::with_capacity(n);
    for handle in handles {
        finished.push(handle.await.unwrap());
    }
    finished.sort();
    finished
}

#[tokio::test(start_paused = true)]
async fn test_requests_beyond_burst_wait_for_refill() {
    // (N - burst) / rate is whole, and rates are powers of two so refill arithmetic is exact
    let cases: [(f64, u32, usize); 3] = [(2.0, 5, 9), (1.0, 3, 7), (4.0, 8, 16)];

    for (rate, burst, n) in cases {
        let limiter = limiter(Channel::KeywordSearch, rate, burst);
        let start = Instant::now();
        let finished = acquire_concurrently(&limiter, Channel::KeywordSearch, n).await;

        let immediate = finished.iter().filter(|t| **t == start).count();
        assert_eq!(immediate, burst as usize, "rate={rate} burst={burst}");

        let floor = ((n - burst as usize) as f64 / rate).ceil();
        let spread = finished[n - 1] - finished[0];
        assert!(
            spread >= Duration::from_secs_f64(floor),
            "rate={rate} burst={burst} n={n}: {spread:?} < {floor}s"
        );
        assert!(spread < Duration::from_secs_f64(floor + 1.0));
    }
}

#[tokio::test(start_paused = true)]
async fn test_channels_do_not_share_budget() {
    let mut limits = HashMap::new();
    limits.insert(Channel::KeywordSearch, ChannelLimit::new(1.0, 1));
    limits.insert(Channel::Batch, ChannelLimit::new(1.0, 1));
    let limiter = RateLimiter::new(&limits).unwrap();

    let start = Instant::now();
    limiter
        .acquire(Channel::KeywordSearch, 1, Duration::from_secs(5))
        .await
        .unwrap();
    limiter
        .acquire(Channel::Batch, 1, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(Instant::now(), start);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reported_when_bucket_stays_empty() {
    let limiter = limiter(Channel::Batch, 0.1, 1);
    limiter
        .acquire(Channel::Batch, 1, Duration::from_secs(1))
        .await
        .unwrap();

    let result = limiter
        .acquire(Channel::Batch, 1, Duration::from_secs(2))
        .await;
    assert!(matches!(result, Err(RateLimitError::Timeout { .. })));
}
