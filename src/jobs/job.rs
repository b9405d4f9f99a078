//! Job records and the job state machine
//!
//! ```text
//! Queued -> Running -> Completed
//!              |
//!              v
//!          Recovering -> Running (retry)
//!              |
//!              v
//!          DeadLettered
//! ```
//!
//! Any non-terminal state may also move to `Failed` on cancellation. `Completed`,
//! `DeadLettered` and `Failed` are terminal.

use super::JobError;
use crate::fetcher::Channel;
use crate::recovery::AttemptRecord;
use crate::validator::RejectionSummary;
use crate::ScrapedRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque job identifier, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying uuid
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted, waiting for dispatch
    Queued,
    /// Fetching pages or validating
    Running,
    /// Waiting for a job-level recovery attempt
    Recovering,
    /// Finished with a validated result set
    Completed,
    /// Recovery schedule exhausted
    DeadLettered,
    /// Cancelled; partial results retained
    Failed,
}

impl JobState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::DeadLettered | JobState::Failed
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Running, Completed)
                | (Running, Recovering)
                | (Running, Failed)
                | (Recovering, Running)
                | (Recovering, DeadLettered)
                | (Recovering, Failed)
        )
    }

    /// Lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Recovering => "recovering",
            JobState::Completed => "completed",
            JobState::DeadLettered => "dead_lettered",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a user-visible failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A page failed with a non-retryable upstream error
    UpstreamFatalError,
    /// A page exhausted its request-level retries
    JobRetryExhausted,
    /// Every job-level recovery attempt failed
    JobRecoveryExhausted,
    /// The job was cancelled
    Cancelled,
}

/// Structured failure attached to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Failure category
    pub kind: ErrorKind,
    /// Human-readable reason
    pub reason: String,
    /// Page that failed, when relevant
    pub page: Option<u32>,
    /// Attempts that led here
    pub attempt_history: Vec<AttemptRecord>,
}

/// A job and everything the orchestrator tracks about it
#[derive(Debug, Clone)]
pub struct Job {
    /// Identity
    pub id: JobId,
    /// Search keyword (trimmed)
    pub keyword: String,
    /// Page bound (1..=20)
    pub max_pages: u32,
    /// Rate channel used for searches
    pub channel: Channel,
    /// Current state
    pub state: JobState,
    /// Progress percentage (0..=100)
    pub progress: u8,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
    /// Non-empty pages fetched in the current run
    pub pages_fetched: u32,
    /// Raw records fetched in the current run
    pub raw_record_count: usize,
    /// Validated records; final once the job is terminal
    pub results: Option<Arc<Vec<ScrapedRecord>>>,
    /// Rejection tally for `results`
    pub rejection_summary: Option<RejectionSummary>,
    /// Last failure
    pub error: Option<ErrorDescriptor>,
    /// Job-level recovery attempts started
    pub recovery_attempts: u32,
}

impl Job {
    /// A queued job.
    pub fn new(keyword: impl Into<String>, max_pages: u32, channel: Channel) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            keyword: keyword.into(),
            max_pages,
            channel,
            state: JobState::Queued,
            progress: 0,
            created_at: now,
            updated_at: now,
            pages_fetched: 0,
            raw_record_count: 0,
            results: None,
            rejection_summary: None,
            error: None,
            recovery_attempts: 0,
        }
    }

    /// Apply a state transition, returning the previous state.
    pub fn transition(&mut self, next: JobState) -> Result<JobState, JobError> {
        let previous = self.state;
        if !previous.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                job_id: self.id,
                from: previous,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        if next == JobState::Running {
            // Every run starts from page 1; partial results of an earlier run are discarded
            self.progress = 0;
            self.pages_fetched = 0;
            self.raw_record_count = 0;
            self.results = None;
            self.rejection_summary = None;
        }
        Ok(previous)
    }

    /// Set progress, clamped to 100.
    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
        self.updated_at = Utc::now();
    }

    /// Snapshot for the external query interface.
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.id,
            keyword: self.keyword.clone(),
            max_pages: self.max_pages,
            state: self.state,
            progress: self.progress,
            pages_fetched: self.pages_fetched,
            raw_record_count: self.raw_record_count,
            record_count: self.results.as_ref().map(|r| r.len()),
            rejection_summary: self.rejection_summary.clone(),
            error: self.error.clone(),
            recovery_attempts: self.recovery_attempts,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Externally visible job status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    /// Job id
    pub job_id: JobId,
    /// Search keyword
    pub keyword: String,
    /// Page bound
    pub max_pages: u32,
    /// Current state
    pub state: JobState,
    /// Progress percentage
    pub progress: u8,
    /// Non-empty pages fetched in the current run
    pub pages_fetched: u32,
    /// Raw records fetched in the current run
    pub raw_record_count: usize,
    /// Validated records, once available
    pub record_count: Option<usize>,
    /// Rejection tally, once validated
    pub rejection_summary: Option<RejectionSummary>,
    /// Last failure
    pub error: Option<ErrorDescriptor>,
    /// Job-level recovery attempts started
    pub recovery_attempts: u32,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

/// Answer to a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAck {
    /// Job addressed
    pub job_id: JobId,
    /// `false` when the job had already reached a terminal state
    pub accepted: bool,
    /// State observed when the request was handled
    pub state: JobState,
}
