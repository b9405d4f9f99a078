//! Job orchestration
//!
//! Every keyword search runs as a job with a well-defined lifecycle:
//!
//! 1. **Submission**: [`Orchestrator::submit_job`] validates the request and queues a [`Job`]
//! 2. **Fetching**: a worker drives the [`crate::fetcher::pagination::PaginationController`]
//! 3. **Validation**: accumulated records pass through the [`crate::validator::ResultValidator`]
//! 4. **Recovery**: retry-exhausted runs are re-run on the [`crate::recovery::RecoveryPolicy`]
//!    schedule and dead-lettered once it is spent
//! 5. **Progress**: every checkpoint is published as a [`ProgressEvent`]
//!
//! # Components
//!
//! - [`orchestrator`] - the external interface: submit, query, fetch, cancel, list dead letters
//! - [`job`] - job records and the state machine
//! - [`registry`] - concurrent job table with per-job locking
//! - [`progress`] - typed progress events and their broadcast bus
//! - [`config`] - configuration constants and [`OrchestratorConfig`]

pub mod config;
pub mod job;
pub mod orchestrator;
pub mod progress;
pub mod registry;

pub use config::OrchestratorConfig;
pub use job::{CancelAck, ErrorDescriptor, ErrorKind, Job, JobId, JobState, JobStatusView};
pub use orchestrator::Orchestrator;
pub use progress::{ProgressBus, ProgressEvent, ProgressKind};
pub use registry::{JobHandle, JobRegistry};

use crate::fetcher::RateLimitError;
use crate::recovery::DeadLetterError;

/// Errors returned by the orchestrator API
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Unknown job id
    #[error("job {0} not found")]
    NotFound(JobId),

    /// Rejected submission
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Results requested before the job could provide them
    #[error("job {job_id} has no results in state {state}")]
    NotCompleted {
        /// Job addressed
        job_id: JobId,
        /// State at the time of the request
        state: JobState,
    },

    /// Attempted transition is not an edge of the state machine
    #[error("job {job_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Job addressed
        job_id: JobId,
        /// Current state
        from: JobState,
        /// Requested state
        to: JobState,
    },

    /// Dead-letter queue failure
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),

    /// Invalid rate-limit configuration
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}
