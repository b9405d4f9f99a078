//! Progress event stream of a job

use crate::support::{collect_events, listings, test_config, ScriptedUpstream};
use listing_scraper::jobs::{JobState, ProgressKind};
use listing_scraper::Orchestrator;
use std::sync::Arc;

#[tokio::test]
async fn test_checkpoints_in_order() {
    let upstream = Arc::new(ScriptedUpstream::new(vec![listings(1, 3), listings(2, 3)]));
    let orchestrator = Orchestrator::new(test_config(), upstream).unwrap();
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator.submit_job("desk lamp", 5).await.unwrap();
    let seen = collect_events(&mut events, job_id).await;

    let progress: Vec<u8> = seen.iter().map(|e| e.progress).collect();
    assert_eq!(progress, vec![0, 0, 18, 36, 95, 100, 100]);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));

    assert_eq!(seen[0].kind, ProgressKind::Queued);
    assert_eq!(seen[0].state, JobState::Queued);
    assert_eq!(seen[1].kind, ProgressKind::Started { run: 1 });
    assert_eq!(
        seen[2].kind,
        ProgressKind::PageFetched {
            page: 1,
            records: 3,
            total_records: 3
        }
    );
    assert_eq!(
        seen[3].kind,
        ProgressKind::PageFetched {
            page: 2,
            records: 3,
            total_records: 6
        }
    );
    assert_eq!(seen[4].kind, ProgressKind::ValidationStarted { raw_records: 6 });
    assert_eq!(
        seen[5].kind,
        ProgressKind::ValidationFinished {
            accepted: 6,
            rejected: 0
        }
    );
    assert_eq!(seen[6].kind, ProgressKind::Completed { records: 6 });
    assert_eq!(seen[6].state, JobState::Completed);
    assert!(seen[..6].iter().all(|e| e.state != JobState::Completed));
}

#[tokio::test]
async fn test_events_serialize_with_tag() {
    let upstream = Arc::new(ScriptedUpstream::new(vec![listings(1, 1)]));
    let orchestrator = Orchestrator::new(test_config(), upstream).unwrap();
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator.submit_job("desk lamp", 1).await.unwrap();
    let seen = collect_events(&mut events, job_id).await;

    let json = serde_json::to_value(seen.last().unwrap()).unwrap();
    assert_eq!(json["kind"]["event"], "completed");
    assert_eq!(json["state"], "completed");
    assert_eq!(json["job_id"], job_id.to_string());
}

#[tokio::test]
async fn test_jobs_listed_with_their_state() {
    let upstream = Arc::new(ScriptedUpstream::new(vec![listings(1, 2)]));
    let orchestrator = Orchestrator::new(test_config(), upstream).unwrap();

    let ids: Vec<_> = orchestrator
        .submit_batch(["desk lamp", "floor lamp"], 1)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    for id in &ids {
        orchestrator.wait_for_terminal(*id).await.unwrap();
    }

    let jobs = orchestrator.list_jobs();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.state == JobState::Completed && j.progress == 100));
}
