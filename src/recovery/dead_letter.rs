//! Dead-letter queue
//!
//! An entry is opened the first time a job exhausts its request-level retries and stays live
//! while recovery attempts run. It is resolved (removed) if a recovery attempt succeeds, parked
//! when the schedule is spent, and otherwise only removed by an operator.

use super::store::DeadLetterFile;
use super::DeadLetterError;
use crate::fetcher::retry::PageFetchAttempt;
use crate::jobs::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// Final disposition of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Request retries exhausted; recovery attempts may still be scheduled
    RetriableExhausted,
    /// No further automatic action
    Parked,
}

/// How a full-job recovery attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAttemptOutcome {
    /// Pagination completed and the job finished
    Succeeded,
    /// Pagination exhausted request retries again
    RetryExhausted,
}

/// One full-job recovery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttempt {
    /// Recovery attempt number (1-based)
    pub recovery_attempt: u32,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// When the attempt ended
    pub finished_at: DateTime<Utc>,
    /// Result
    pub outcome: JobAttemptOutcome,
    /// Pages retrieved before it ended
    pub pages_fetched: u32,
    /// Upstream calls made
    pub request_attempts: u32,
    /// Last error, when it failed
    pub error: Option<String>,
}

/// One entry of a job's attempt history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum AttemptRecord {
    /// A single upstream call
    Request(PageFetchAttempt),
    /// A full-job recovery attempt
    Job(JobAttempt),
}

/// A job that exhausted request-level retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Job reference
    pub job_id: JobId,
    /// Search keyword of the job
    pub keyword: String,
    /// Page bound of the job
    pub max_pages: u32,
    /// Latest failure reason
    pub reason: String,
    /// Request-level attempts of the first exhausted run, then one record per recovery attempt
    pub attempts: Vec<AttemptRecord>,
    /// Recovery attempts made so far
    pub recovery_attempts: u32,
    /// Next scheduled recovery, `None` once parked
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Current disposition
    pub disposition: Disposition,
    /// When the entry was opened
    pub created_at: DateTime<Utc>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Open an entry from the request-level attempts of an exhausted run.
    pub fn new(
        job_id: JobId,
        keyword: impl Into<String>,
        max_pages: u32,
        reason: impl Into<String>,
        request_attempts: Vec<PageFetchAttempt>,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        let disposition = if next_retry_at.is_some() {
            Disposition::RetriableExhausted
        } else {
            Disposition::Parked
        };
        Self {
            job_id,
            keyword: keyword.into(),
            max_pages,
            reason: reason.into(),
            attempts: request_attempts
                .into_iter()
                .map(AttemptRecord::Request)
                .collect(),
            recovery_attempts: 0,
            next_retry_at,
            disposition,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of request-level records
    pub fn request_attempt_count(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| matches!(a, AttemptRecord::Request(_)))
            .count()
    }

    /// Number of job-level records
    pub fn job_attempt_count(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| matches!(a, AttemptRecord::Job(_)))
            .count()
    }

    /// Stop any further automatic action.
    pub fn park(&mut self, reason: impl Into<String>) {
        self.reason = reason.into();
        self.next_retry_at = None;
        self.disposition = Disposition::Parked;
        self.updated_at = Utc::now();
    }
}

/// Ordered set of dead-letter entries, optionally persisted to a JSON file
///
/// Mutations snapshot the entries under the state lock and write the file after releasing it,
/// so readers never wait on disk I/O. Writes are serialized and a snapshot older than the last
/// one written is dropped.
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    state: Mutex<QueueState>,
    path: Option<PathBuf>,
    /// Revision of the last snapshot written to `path`
    written: Mutex<u64>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: Vec<DeadLetterEntry>,
    revision: u64,
}

impl DeadLetterQueue {
    /// In-memory queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue persisted at `path`, loading any entries already there.
    pub fn with_persistence(path: impl Into<PathBuf>) -> Result<Self, DeadLetterError> {
        let path = path.into();
        let file = DeadLetterFile::load(&path)?;
        let queue = Self {
            state: Mutex::new(QueueState {
                entries: file.into_entries(),
                revision: 0,
            }),
            path: Some(path),
            written: Mutex::new(0),
        };
        // Write back entries parked during load
        queue.commit(queue.lock())?;
        Ok(queue)
    }

    /// Backing file, if persisted
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Add a new entry. A job may only have one live entry.
    pub fn open(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
        let mut state = self.lock();
        if state.entries.iter().any(|e| e.job_id == entry.job_id) {
            return Err(DeadLetterError::AlreadyExists(entry.job_id));
        }
        info!(
            job_id = %entry.job_id,
            keyword = %entry.keyword,
            attempts = entry.attempts.len(),
            next_retry_at = ?entry.next_retry_at,
            "Dead-letter entry opened"
        );
        state.entries.push(entry);
        self.commit(state)
    }

    /// Append a recovery attempt and set the next scheduled retry.
    pub fn record_job_attempt(
        &self,
        job_id: JobId,
        attempt: JobAttempt,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), DeadLetterError> {
        let mut state = self.lock();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.job_id == job_id)
            .ok_or(DeadLetterError::NotFound(job_id))?;

        entry.recovery_attempts = entry.recovery_attempts.max(attempt.recovery_attempt);
        if let Some(error) = &attempt.error {
            entry.reason = error.clone();
        }
        entry.attempts.push(AttemptRecord::Job(attempt));
        entry.next_retry_at = next_retry_at;
        entry.updated_at = Utc::now();
        self.commit(state)
    }

    /// Park the entry for `job_id`.
    pub fn park(&self, job_id: JobId, reason: impl Into<String>) -> Result<(), DeadLetterError> {
        let mut state = self.lock();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.job_id == job_id)
            .ok_or(DeadLetterError::NotFound(job_id))?;
        entry.park(reason);
        warn!(
            job_id = %job_id,
            attempts = entry.attempts.len(),
            "Job dead-lettered"
        );
        self.commit(state)
    }

    /// Drop the entry of a job that recovered.
    pub fn resolve(&self, job_id: JobId) -> Result<bool, DeadLetterError> {
        let removed = self.take(job_id)?;
        if removed {
            info!(job_id = %job_id, "Job recovered, dead-letter entry resolved");
        }
        Ok(removed)
    }

    /// Operator removal. Returns whether an entry existed.
    pub fn remove(&self, job_id: JobId) -> Result<bool, DeadLetterError> {
        let removed = self.take(job_id)?;
        if removed {
            info!(job_id = %job_id, "Dead-letter entry removed by operator");
        }
        Ok(removed)
    }

    /// Entry for `job_id`, if any.
    pub fn get(&self, job_id: JobId) -> Option<DeadLetterEntry> {
        self.lock().entries.iter().find(|e| e.job_id == job_id).cloned()
    }

    /// All entries in the order they were opened.
    pub fn list(&self) -> Vec<DeadLetterEntry> {
        self.lock().entries.clone()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn take(&self, job_id: JobId) -> Result<bool, DeadLetterError> {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.job_id != job_id);
        if state.entries.len() == before {
            return Ok(false);
        }
        self.commit(state)?;
        Ok(true)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot the mutated state, release the state lock, then write the snapshot.
    fn commit(&self, mut state: MutexGuard<'_, QueueState>) -> Result<(), DeadLetterError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        state.revision += 1;
        let revision = state.revision;
        let snapshot = DeadLetterFile::new(state.entries.clone());
        drop(state);

        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        if *written >= revision {
            return Ok(());
        }
        snapshot.save(path)?;
        *written = revision;
        Ok(())
    }
}
