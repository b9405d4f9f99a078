//! End-to-end job runs against a scripted upstream

use crate::support::{listings, test_config, ScriptedUpstream};
use listing_scraper::jobs::{ErrorKind, JobError};
use listing_scraper::{JobState, Orchestrator, RawListing};
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test]
async fn test_three_pages_with_duplicates_complete() {
    let page1 = listings(1, 20);
    let mut page2 = listings(2, 17);
    // Same catalog numbers as page 1, listed again under a different url
    page2.extend(page1.iter().take(3).map(|listing| {
        let mut again = listing.clone();
        again.url = again.url.map(|u| u.replace("desk-lamp", "desk-lamp-sale"));
        again
    }));
    let page3 = listings(3, 5);

    let upstream = Arc::new(ScriptedUpstream::new(vec![page1, page2, page3]));
    let orchestrator = Orchestrator::new(test_config(), upstream.clone()).unwrap();

    let job_id = orchestrator.submit_job("desk lamp", 5).await.unwrap();
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.pages_fetched, 3);
    assert_eq!(status.raw_record_count, 45);
    assert_eq!(status.record_count, Some(42));
    assert!(status.error.is_none());

    let summary = status.rejection_summary.unwrap();
    assert_eq!(summary.total_input, 45);
    assert_eq!(summary.duplicate, 3);
    assert_eq!(summary.missing_field, 0);

    // The empty fourth page ends pagination
    assert_eq!(upstream.pages_requested(), vec![1, 2, 3, 4]);

    let records = orchestrator.fetch_results(job_id).await.unwrap();
    assert_eq!(records.len(), 42);
    assert_eq!(records.first().unwrap().source_page, 1);
    assert_eq!(records.last().unwrap().source_page, 3);
    let pages: Vec<u32> = records.iter().map(|r| r.source_page).collect();
    assert!(pages.windows(2).all(|w| w[0] <= w[1]));

    let ids: HashSet<&str> = records.iter().map(|r| r.item_id.as_str()).collect();
    let urls: HashSet<&str> = records.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(ids.len(), records.len());
    assert_eq!(urls.len(), records.len());
    assert!(records.iter().all(|r| !r.url.contains('?')));
    assert!(records
        .iter()
        .all(|r| (0.0..=1.0).contains(&r.quality_score) && (0.0..=1.0).contains(&r.completeness_score)));
}

#[tokio::test]
async fn test_record_missing_identifier_and_url_dropped() {
    let mut page = listings(1, 4);
    page.push(RawListing {
        title: Some("Lamp without a catalog number".to_string()),
        ..RawListing::default()
    });

    let upstream = Arc::new(ScriptedUpstream::new(vec![page]));
    let orchestrator = Orchestrator::new(test_config(), upstream).unwrap();

    let job_id = orchestrator.submit_job("desk lamp", 1).await.unwrap();
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();
    assert_eq!(status.state, JobState::Completed);

    let summary = status.rejection_summary.unwrap();
    assert_eq!(summary.missing_field, 1);
    assert_eq!(summary.accepted, 4);
    assert_eq!(summary.samples.len(), 1);

    let records = orchestrator.fetch_results(job_id).await.unwrap();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.title != "Lamp without a catalog number"));
}

#[tokio::test]
async fn test_max_pages_bounds_fetching() {
    let upstream = Arc::new(ScriptedUpstream::new(
        (1..=6).map(|page| listings(page, 2)).collect(),
    ));
    let orchestrator = Orchestrator::new(test_config(), upstream.clone()).unwrap();

    let job_id = orchestrator.submit_job("desk lamp", 2).await.unwrap();
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.pages_fetched, 2);
    assert_eq!(upstream.pages_requested(), vec![1, 2]);
}

#[tokio::test]
async fn test_fatal_page_error_keeps_earlier_pages() {
    let upstream = Arc::new(
        ScriptedUpstream::new(vec![listings(1, 3), listings(2, 3), listings(3, 3)]).fail_page(2, 404),
    );
    let orchestrator = Orchestrator::new(test_config(), upstream.clone()).unwrap();

    let job_id = orchestrator.submit_job("desk lamp", 5).await.unwrap();
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.recovery_attempts, 0);
    // A 404 is never retried
    assert_eq!(upstream.pages_requested(), vec![1, 2]);

    let error = status.error.unwrap();
    assert_eq!(error.kind, ErrorKind::UpstreamFatalError);
    assert_eq!(error.page, Some(2));

    assert_eq!(orchestrator.fetch_results(job_id).await.unwrap().len(), 3);
    assert!(orchestrator.list_dead_letters().is_empty());
}

#[tokio::test]
async fn test_results_unavailable_before_completion() {
    let upstream = Arc::new(ScriptedUpstream::new(vec![listings(1, 2)]).hold_from(1));
    let orchestrator = Orchestrator::new(test_config(), upstream).unwrap();

    let job_id = orchestrator.submit_job("desk lamp", 1).await.unwrap();
    assert!(matches!(
        orchestrator.fetch_results(job_id).await,
        Err(JobError::NotCompleted { .. })
    ));

    orchestrator.cancel_job(job_id).await.unwrap();
    orchestrator.wait_for_terminal(job_id).await.unwrap();
}
