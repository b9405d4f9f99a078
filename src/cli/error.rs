//! CLI error types and conversions

use crate::fetcher::FetcherError;
use crate::jobs::{JobError, JobId, JobState};
use crate::output::OutputError;
use crate::recovery::DeadLetterError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Orchestrator error
    #[error("job error: {0}")]
    JobError(#[from] JobError),

    /// Fetcher error
    #[error("fetcher error: {0}")]
    FetcherError(#[from] FetcherError),

    /// Output error
    #[error("output error: {0}")]
    OutputError(#[from] OutputError),

    /// Dead-letter queue error
    #[error("dead-letter error: {0}")]
    DeadLetterError(#[from] DeadLetterError),

    /// A job did not complete
    #[error("job {job_id} ended as {state}: {reason}")]
    JobFailed {
        /// Job that failed
        job_id: JobId,
        /// Terminal state
        state: JobState,
        /// Reason from the job's error descriptor
        reason: String,
    },

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}
