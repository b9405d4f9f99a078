//! Cooperative cancellation of running and recovering jobs

use crate::support::{collect_events, listings, test_config, ScriptedUpstream};
use listing_scraper::jobs::{ErrorKind, JobError, ProgressKind};
use listing_scraper::recovery::Disposition;
use listing_scraper::{JobState, Orchestrator};
use std::sync::Arc;

#[tokio::test]
async fn test_cancel_after_second_page_keeps_fetched_pages() {
    let upstream = Arc::new(
        ScriptedUpstream::new((1..=5).map(|page| listings(page, 10)).collect()).hold_from(3),
    );
    let orchestrator = Orchestrator::new(test_config(), upstream.clone()).unwrap();
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator.submit_job("desk lamp", 5).await.unwrap();
    loop {
        let event = events.recv().await.unwrap();
        if event.job_id == job_id && matches!(event.kind, ProgressKind::PageFetched { page: 2, .. }) {
            break;
        }
    }

    let ack = orchestrator.cancel_job(job_id).await.unwrap();
    assert!(ack.accepted);

    let rest = collect_events(&mut events, job_id).await;
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.pages_fetched, 2);
    assert_eq!(status.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert!(rest
        .iter()
        .all(|e| !matches!(e.kind, ProgressKind::Recovering { .. } | ProgressKind::PageFetched { .. })));
    assert!(matches!(
        rest.last().map(|e| &e.kind),
        Some(ProgressKind::Failed { .. })
    ));

    // Page 3 was requested but never delivered; nothing after it was asked for
    assert_eq!(upstream.pages_requested(), vec![1, 2, 3]);

    let partial = orchestrator.fetch_partial_results(job_id).await.unwrap();
    assert_eq!(partial.len(), 20);
    assert!(partial.iter().all(|r| r.source_page <= 2));
    assert!(matches!(
        orchestrator.fetch_results(job_id).await,
        Err(JobError::NotCompleted { state: JobState::Failed, .. })
    ));
    assert!(orchestrator.list_dead_letters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_waiting_for_recovery() {
    let orchestrator =
        Orchestrator::new(test_config(), Arc::new(ScriptedUpstream::always_failing(500))).unwrap();
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator.submit_job("desk lamp", 1).await.unwrap();
    loop {
        let event = events.recv().await.unwrap();
        if event.job_id == job_id && matches!(event.kind, ProgressKind::Recovering { .. }) {
            break;
        }
    }
    assert_eq!(orchestrator.query_state(job_id).await.unwrap().state, JobState::Recovering);

    assert!(orchestrator.cancel_job(job_id).await.unwrap().accepted);
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    let entries = orchestrator.list_dead_letters();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].disposition, Disposition::Parked);
    assert!(entries[0].next_retry_at.is_none());
}

#[tokio::test]
async fn test_cancel_all_stops_every_live_job() {
    let upstream = Arc::new(ScriptedUpstream::new(vec![listings(1, 1)]).hold_from(1));
    let orchestrator = Orchestrator::new(test_config(), upstream).unwrap();

    let first = orchestrator.submit_job("desk lamp", 1).await.unwrap();
    let second = orchestrator.submit_job("floor lamp", 1).await.unwrap();
    assert_eq!(orchestrator.cancel_all(), 2);

    for job_id in [first, second] {
        let status = orchestrator.wait_for_terminal(job_id).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
    }
    assert_eq!(orchestrator.cancel_all(), 0);
}
