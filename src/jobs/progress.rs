//! Typed progress events
//!
//! The orchestrator publishes one [`ProgressEvent`] per checkpoint and state change on a bounded
//! broadcast channel. Transports (push notifications, polling endpoints, the CLI bar) subscribe
//! and pull; a subscriber that falls behind loses the oldest events, never blocks a job.

use super::{JobId, JobState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressKind {
    /// Accepted and waiting for a worker
    Queued,
    /// A run began (run 1 is the first attempt, later runs are recoveries)
    Started {
        /// Run number
        run: u32,
    },
    /// A non-empty page arrived
    PageFetched {
        /// Page index
        page: u32,
        /// Records on the page
        records: usize,
        /// Records so far in this run
        total_records: usize,
    },
    /// Validation of the accumulated records began
    ValidationStarted {
        /// Raw records handed to the validator
        raw_records: usize,
    },
    /// Validation finished
    ValidationFinished {
        /// Records kept
        accepted: usize,
        /// Records dropped
        rejected: usize,
    },
    /// Waiting for a job-level recovery attempt
    Recovering {
        /// Upcoming recovery attempt (1-based)
        attempt: u32,
        /// When it will start
        retry_at: DateTime<Utc>,
    },
    /// Terminal: results available
    Completed {
        /// Final record count
        records: usize,
    },
    /// Terminal: recovery schedule exhausted
    DeadLettered {
        /// Attempt history length
        attempts: usize,
    },
    /// Terminal: cancelled
    Failed {
        /// Why
        reason: String,
    },
}

/// One progress checkpoint of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Job the event belongs to
    pub job_id: JobId,
    /// State after the event
    pub state: JobState,
    /// Progress percentage after the event
    pub progress: u8,
    /// Event detail
    pub kind: ProgressKind,
    /// When it was emitted
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    /// Event stamped with the current time.
    pub fn new(job_id: JobId, state: JobState, progress: u8, kind: ProgressKind) -> Self {
        Self {
            job_id,
            state,
            progress,
            kind,
            at: Utc::now(),
        }
    }

    /// Whether the event ends the job's stream
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[PROGRESS] {} {:>3}% ", self.job_id, self.progress)?;
        match &self.kind {
            ProgressKind::Queued => write!(f, "queued"),
            ProgressKind::Started { run: 1 } => write!(f, "started"),
            ProgressKind::Started { run } => write!(f, "recovery run {} started", run - 1),
            ProgressKind::PageFetched {
                page,
                records,
                total_records,
            } => write!(
                f,
                "page {page} fetched ({records} records, {total_records} total)"
            ),
            ProgressKind::ValidationStarted { raw_records } => {
                write!(f, "validating {raw_records} records")
            }
            ProgressKind::ValidationFinished { accepted, rejected } => {
                write!(f, "validated: {accepted} kept, {rejected} dropped")
            }
            ProgressKind::Recovering { attempt, retry_at } => write!(
                f,
                "recovering: attempt {attempt} at {}",
                retry_at.format("%H:%M:%S UTC")
            ),
            ProgressKind::Completed { records } => write!(f, "completed with {records} records"),
            ProgressKind::DeadLettered { attempts } => {
                write!(f, "dead-lettered after {attempts} attempts")
            }
            ProgressKind::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Bounded fan-out of progress events
#[derive(Debug, Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    /// Bus buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New subscriber receiving events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: ProgressEvent) {
        tracing::debug!(job_id = %event.job_id, state = %event.state, progress = event.progress, "{}", event);
        let _ = self.tx.send(event);
    }

    /// Current subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Progress after `pages` of `max_pages` pages.
pub fn page_progress(pages: u32, max_pages: u32) -> u8 {
    if max_pages == 0 {
        return 0;
    }
    let share = u32::from(super::config::PAGES_PROGRESS_SHARE);
    let pct = share * pages.min(max_pages) / max_pages;
    u8::try_from(pct).unwrap_or(super::config::PAGES_PROGRESS_SHARE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_progress() {
        assert_eq!(page_progress(0, 5), 0);
        assert_eq!(page_progress(1, 5), 18);
        assert_eq!(page_progress(5, 5), 90);
        assert_eq!(page_progress(9, 5), 90);
        assert_eq!(page_progress(1, 0), 0);
    }

    #[test]
    fn test_display_format() {
        let job_id = JobId::new();
        let event = ProgressEvent::new(
            job_id,
            JobState::Running,
            36,
            ProgressKind::PageFetched {
                page: 2,
                records: 20,
                total_records: 40,
            },
        );
        assert_eq!(
            event.to_string(),
            format!("[PROGRESS] {job_id}  36% page 2 fetched (20 records, 40 total)")
        );
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = ProgressBus::new(4);
        let mut rx = bus.subscribe();
        let job_id = JobId::new();

        bus.publish(ProgressEvent::new(job_id, JobState::Queued, 0, ProgressKind::Queued));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id, job_id);
        assert_eq!(event.kind, ProgressKind::Queued);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = ProgressBus::new(1);
        bus.publish(ProgressEvent::new(JobId::new(), JobState::Queued, 0, ProgressKind::Queued));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
