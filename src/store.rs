//! Job persistence.
//!
//! The store is the only shared mutable state in the spooler. Every update
//! runs against a copy of the record which is committed only if the update
//! succeeds, so a rejected transition never leaves a half-modified job.
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::StoreError;
use crate::types::job::{Job, JobId};
use crate::types::states::JobStatus;

pub trait JobStore: Send + Sync {
    /// Persists a newly admitted job.
    fn insert(&self, job: Job) -> Result<(), StoreError>;

    /// Returns a snapshot of the job, if it exists.
    fn get(&self, id: &JobId) -> Option<Job>;

    /// Atomically applies `f` to the job, returning the committed record.
    /// If `f` fails, nothing is written.
    fn update(
        &self,
        id: &JobId,
        f: &mut dyn FnMut(&mut Job) -> Result<(), StoreError>,
    ) -> Result<Job, StoreError>;

    /// Ids of every job held, in no particular order.
    fn ids(&self) -> Vec<JobId>;

    /// Moves the job from `expected` to `to` if and only if it's currently
    /// in `expected`. Returns whether the swap happened.
    fn compare_and_set_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StoreError> {
        let mut swapped = false;
        self.update(id, &mut |job| {
            swapped = false;
            if job.status == expected {
                job.advance(to)?;
                swapped = true;
            }
            Ok(())
        })?;

        Ok(swapped)
    }

    /// Sets the one-shot `notified` flag on a terminal job. Returns true only
    /// for the caller that flipped it.
    fn take_notification(&self, id: &JobId) -> Result<bool, StoreError> {
        let mut taken = false;
        self.update(id, &mut |job| {
            taken = job.status.is_terminal() && !job.notified;
            if taken {
                job.notified = true;
            }
            Ok(())
        })?;

        Ok(taken)
    }
}

/// Process-local store backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Job>> {
        // A panic while holding the lock can't leave a record half-written
        // (updates commit whole copies), so poisoning is safe to ignore.
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl JobStore for MemoryStore {
    fn insert(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }

        jobs.insert(job.id, job);
        Ok(())
    }

    fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs().get(id).cloned()
    }

    fn update(
        &self,
        id: &JobId,
        f: &mut dyn FnMut(&mut Job) -> Result<(), StoreError>,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs();
        let slot = jobs.get_mut(id).ok_or(StoreError::NotFound(*id))?;

        let mut job = slot.clone();
        f(&mut job)?;
        *slot = job.clone();

        Ok(job)
    }

    fn ids(&self) -> Vec<JobId> {
        self.jobs().keys().copied().collect()
    }
}
