//! Concurrent job table
//!
//! Each job lives behind its own lock, so transitions of unrelated jobs never contend. Locks are
//! only held for short synchronous sections. The latest state is mirrored into a `watch`
//! channel for waiters.

use super::job::{Job, JobId, JobState};
use super::JobError;
use crate::shutdown::{CancelSignal, SharedCancel};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// A registered job with its cancellation signal
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    job: Mutex<Job>,
    cancel: SharedCancel,
    state_tx: watch::Sender<JobState>,
}

impl JobHandle {
    fn new(job: Job) -> Self {
        let (state_tx, _) = watch::channel(job.state);
        Self {
            id: job.id,
            job: Mutex::new(job),
            cancel: CancelSignal::shared(),
            state_tx,
        }
    }

    /// Job id
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Exclusive access to the job record. Never held across an await point.
    pub fn lock(&self) -> MutexGuard<'_, Job> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clone of the job record.
    pub fn snapshot(&self) -> Job {
        self.lock().clone()
    }

    /// Apply a transition under the job lock, letting `update` adjust the record atomically
    /// with it. Returns the previous state.
    pub fn transition_with<F>(&self, next: JobState, update: F) -> Result<JobState, JobError>
    where
        F: FnOnce(&mut Job),
    {
        let mut job = self.lock();
        let previous = job.transition(next)?;
        update(&mut job);
        self.state_tx.send_replace(next);
        Ok(previous)
    }

    /// Apply a transition. Returns the previous state.
    pub fn transition(&self, next: JobState) -> Result<JobState, JobError> {
        self.transition_with(next, |_| {})
    }

    /// Cancellation signal of this job
    pub fn cancel_signal(&self) -> &SharedCancel {
        &self.cancel
    }

    /// Latest state without taking the job lock
    pub fn current_state(&self) -> JobState {
        *self.state_tx.borrow()
    }

    /// Resolve once the job reaches a terminal state.
    pub async fn wait_terminal(&self) -> JobState {
        let mut rx = self.state_tx.subscribe();
        let state = match rx.wait_for(JobState::is_terminal).await {
            Ok(state) => *state,
            // Sender lives as long as the handle
            Err(_) => self.current_state(),
        };
        state
    }
}

/// Job id to job handle map
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, Arc<JobHandle>>,
}

impl JobRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job.
    pub fn insert(&self, job: Job) -> Arc<JobHandle> {
        let handle = Arc::new(JobHandle::new(job));
        self.jobs.insert(handle.id(), handle.clone());
        handle
    }

    /// Handle for `id`.
    pub fn get(&self, id: JobId) -> Result<Arc<JobHandle>, JobError> {
        self.jobs
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(JobError::NotFound(id))
    }

    /// Snapshots of every job, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let handles: Vec<Arc<JobHandle>> =
            self.jobs.iter().map(|entry| entry.value().clone()).collect();
        let mut jobs: Vec<Job> = handles.iter().map(|handle| handle.snapshot()).collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Handles of jobs not yet terminal.
    pub fn live(&self) -> Vec<Arc<JobHandle>> {
        self.jobs
            .iter()
            .filter(|entry| !entry.value().current_state().is_terminal())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of registered jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no job is registered
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
