//! Request-level retries seen through a whole job

use crate::support::{listings, rate_limited, status_error, test_config, ScriptedUpstream};
use listing_scraper::fetcher::retry::RetryPolicy;
use listing_scraper::fetcher::FetcherError;
use listing_scraper::{JobState, Orchestrator};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_rate_limited_three_times_then_succeeds() {
    let upstream = Arc::new(
        ScriptedUpstream::new(vec![listings(1, 5)])
            .fail_first([rate_limited(), rate_limited(), rate_limited()]),
    );
    // Four attempts so the fourth can succeed
    let config = test_config()
        .with_retry_policy(RetryPolicy::default().with_max_attempts(4).without_jitter());
    let orchestrator = Orchestrator::new(config, upstream.clone()).unwrap();

    let job_id = orchestrator.submit_job("desk lamp", 1).await.unwrap();
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.recovery_attempts, 0);
    assert_eq!(status.record_count, Some(5));
    assert!(orchestrator.list_dead_letters().is_empty());

    let calls = upstream.calls();
    assert_eq!(calls.len(), 4);
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].at - w[0].at).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_hint_replaces_backoff() {
    let upstream = Arc::new(
        ScriptedUpstream::new(vec![listings(1, 1)]).fail_first([FetcherError::UpstreamRateLimited {
            retry_after: Some(Duration::from_secs(7)),
        }]),
    );
    let orchestrator = Orchestrator::new(test_config(), upstream.clone()).unwrap();

    let job_id = orchestrator.submit_job("desk lamp", 1).await.unwrap();
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();
    assert_eq!(status.state, JobState::Completed);

    let calls = upstream.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].at - calls[0].at, Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn test_day_long_retry_after_waits_only_the_cap() {
    let upstream = Arc::new(
        ScriptedUpstream::new(vec![listings(1, 1)]).fail_first([FetcherError::UpstreamRateLimited {
            retry_after: Some(Duration::from_secs(86_400)),
        }]),
    );
    let orchestrator = Orchestrator::new(test_config(), upstream.clone()).unwrap();

    let job_id = orchestrator.submit_job("desk lamp", 1).await.unwrap();
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();
    assert_eq!(status.state, JobState::Completed);

    let calls = upstream.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].at - calls[0].at, RetryPolicy::default().max_delay);
}

#[tokio::test(start_paused = true)]
async fn test_server_errors_recover_within_request_budget() {
    let upstream = Arc::new(
        ScriptedUpstream::new(vec![listings(1, 2), listings(2, 2)])
            .fail_first([status_error(502), status_error(503)]),
    );
    let orchestrator = Orchestrator::new(test_config(), upstream.clone()).unwrap();

    let job_id = orchestrator.submit_job("desk lamp", 2).await.unwrap();
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.pages_fetched, 2);
    assert_eq!(upstream.pages_requested(), vec![1, 1, 1, 2]);
}
