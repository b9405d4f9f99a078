//! Job-level recovery and dead-lettering
//!
//! Runs one tier above the request-level retry engine. A job whose pagination exhausts its
//! request retries is re-run from page 1 after each delay of the [`RecoveryPolicy`]; once the
//! schedule is spent the job is parked in the [`DeadLetterQueue`] for an operator.

pub mod dead_letter;
pub mod store;

pub use dead_letter::{
    AttemptRecord, DeadLetterEntry, DeadLetterQueue, Disposition, JobAttempt, JobAttemptOutcome,
};
pub use store::{DeadLetterFile, MAX_DEAD_LETTER_FILE_SIZE};

use crate::jobs::config::RECOVERY_DELAYS_SECS;
use crate::jobs::JobId;
use std::time::Duration;

/// Dead-letter queue errors
#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    /// No entry for the job
    #[error("no dead-letter entry for job {0}")]
    NotFound(JobId),

    /// The job already has a live entry
    #[error("job {0} already has a dead-letter entry")]
    AlreadyExists(JobId),

    /// Filesystem failure
    #[error("dead-letter I/O error: {0}")]
    Io(String),

    /// Advisory lock failure
    #[error("dead-letter lock error: {0}")]
    Lock(String),

    /// Encoding failure
    #[error("dead-letter serialization error: {0}")]
    Serialization(String),

    /// Decoding failure
    #[error("dead-letter file is corrupt: {0}")]
    Deserialization(String),

    /// File exceeds the size limit
    #[error("dead-letter file is {size} bytes (max {max})")]
    TooLarge {
        /// Actual size
        size: u64,
        /// Allowed size
        max: u64,
    },

    /// Unsupported schema version
    #[error("dead-letter schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch {
        /// Supported version
        expected: String,
        /// Version found on disk
        found: String,
    },
}

/// Delays before each full-job recovery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPolicy {
    delays: Vec<Duration>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            delays: RECOVERY_DELAYS_SECS
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
        }
    }
}

impl RecoveryPolicy {
    /// Policy with explicit delays. An empty list dead-letters on first exhaustion.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Delay before recovery attempt `attempt` (1-based), or `None` once the schedule is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        let index = usize::try_from(attempt.checked_sub(1)?).ok()?;
        self.delays.get(index).copied()
    }

    /// Number of recovery attempts in the schedule
    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.delays.len()).unwrap_or(u32::MAX)
    }

    /// All delays, in order
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}
