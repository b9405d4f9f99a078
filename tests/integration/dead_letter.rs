//! Job-level recovery and dead-lettering

use crate::support::{collect_events, listings, status_error, test_config, ScriptedUpstream};
use listing_scraper::jobs::{ErrorKind, ProgressKind};
use listing_scraper::recovery::{AttemptRecord, DeadLetterQueue, Disposition};
use listing_scraper::{JobState, Orchestrator};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

#[tokio::test(start_paused = true)]
async fn test_persistent_server_errors_dead_letter_once() {
    let upstream = Arc::new(ScriptedUpstream::always_failing(500));
    let orchestrator = Orchestrator::new(test_config(), upstream.clone()).unwrap();
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator.submit_job("desk lamp", 5).await.unwrap();
    let seen = collect_events(&mut events, job_id).await;
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();

    assert_eq!(status.state, JobState::DeadLettered);
    assert_eq!(status.recovery_attempts, 3);
    assert_eq!(status.error.as_ref().unwrap().kind, ErrorKind::JobRecoveryExhausted);
    assert_eq!(status.error.as_ref().unwrap().attempt_history.len(), 6);

    let dead_lettered = seen
        .iter()
        .filter(|e| matches!(e.kind, ProgressKind::DeadLettered { .. }))
        .count();
    assert_eq!(dead_lettered, 1);
    let recovering: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e.kind {
            ProgressKind::Recovering { attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(recovering, vec![1, 2, 3]);

    let entries = orchestrator.list_dead_letters();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.job_id, job_id);
    assert_eq!(entry.disposition, Disposition::Parked);
    assert_eq!(entry.attempts.len(), 6);
    assert_eq!(entry.request_attempt_count(), 3);
    assert_eq!(entry.job_attempt_count(), 3);
    assert!(matches!(entry.attempts[0], AttemptRecord::Request(_)));
    assert!(matches!(entry.attempts[5], AttemptRecord::Job(_)));

    // 3 requests for page 1 per run: the first run and 3 recovery runs
    let calls = upstream.calls();
    assert_eq!(calls.len(), 12);
    assert!(calls.iter().all(|c| c.page == 1));

    // Each recovery run starts after its scheduled delay
    let run_starts = [calls[3].at - calls[2].at, calls[6].at - calls[5].at, calls[9].at - calls[8].at];
    assert_eq!(
        run_starts,
        [
            Duration::from_secs(60),
            Duration::from_secs(300),
            Duration::from_secs(900)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_recovery_run_succeeds() {
    // First run exhausts its three attempts on page 1, the recovery run succeeds
    let upstream = Arc::new(
        ScriptedUpstream::new(vec![listings(1, 4)])
            .fail_first([status_error(500), status_error(500), status_error(500)]),
    );
    let orchestrator = Orchestrator::new(test_config(), upstream.clone()).unwrap();

    let job_id = orchestrator.submit_job("desk lamp", 1).await.unwrap();
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.record_count, Some(4));
    assert!(status.error.is_none());
    assert!(orchestrator.list_dead_letters().is_empty());
    assert_eq!(upstream.calls().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_after_good_pages_restarts_from_first_page() {
    // Page 1 succeeds, page 2 exhausts; the recovery run starts over at page 1
    let upstream = Arc::new(ScriptedUpstream::new(vec![listings(1, 2)]).fail_page(2, 503));
    let orchestrator = Orchestrator::new(test_config(), upstream.clone()).unwrap();

    let job_id = orchestrator.submit_job("desk lamp", 2).await.unwrap();
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();

    assert_eq!(status.state, JobState::DeadLettered);
    let requested = upstream.pages_requested();
    assert_eq!(&requested[..5], &[1, 2, 2, 2, 1]);
    // Records of the last run are retained for inspection
    assert_eq!(orchestrator.fetch_partial_results(job_id).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dead_letters_persist_across_restarts() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dead_letters.json");

    let config = test_config().with_dead_letter_path(&path);
    let orchestrator =
        Orchestrator::new(config, Arc::new(ScriptedUpstream::always_failing(500))).unwrap();
    let job_id = orchestrator.submit_job("desk lamp", 1).await.unwrap();
    orchestrator.wait_for_terminal(job_id).await.unwrap();

    let reloaded = DeadLetterQueue::with_persistence(&path).unwrap();
    let entry = reloaded.get(job_id).unwrap();
    assert_eq!(entry.disposition, Disposition::Parked);
    assert_eq!(entry.attempts.len(), 6);

    // Removal through the orchestrator is persisted too
    assert!(orchestrator.remove_dead_letter(job_id).unwrap());
    assert!(DeadLetterQueue::with_persistence(&path).unwrap().is_empty());
}
