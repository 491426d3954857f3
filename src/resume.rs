//! Reprinting only what a finished job failed to print.
use tracing::info;

use crate::error::JobError;
use crate::queue::PriorityQueue;
use crate::types::job::{JobId, Priority};

/// Queues a new high-priority job holding exactly the failed units of
/// `source`, in their original order. The source job isn't touched, so
/// resuming twice yields two independent follow-up jobs.
pub fn resume(queue: &PriorityQueue, source: &JobId) -> Result<JobId, JobError> {
    let job = queue
        .store()
        .get(source)
        .ok_or(JobError::NotFound(*source))?;

    if !job.status.is_terminal() || job.failed_units.is_empty() {
        return Err(JobError::NotResumable(*source));
    }

    let units = job
        .failed_units
        .iter()
        .filter_map(|&index| job.unit(index).cloned())
        .collect();

    let id = queue.admit(units, &job.printer_ref, Priority::High, Some(*source))?;

    info!(
        %id,
        from = %source,
        units = job.failed_units.len(),
        "resumed failed units"
    );

    Ok(id)
}
