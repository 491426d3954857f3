//! The caller-facing surface: submit, status, cancel and resume.
use std::sync::Arc;

use bytes::Bytes;
use tracing::info;

use crate::error::{JobError, SubmitError};
use crate::poller::{NotificationSink, StatusPoller};
use crate::queue::PriorityQueue;
use crate::resume;
use crate::types::job::{JobId, Priority};
use crate::types::states::JobStatus;
use crate::types::view::{JobStatusView, QueueStats};

pub struct Spooler {
    queue: Arc<PriorityQueue>,
    poller: Arc<StatusPoller>,
}

impl Spooler {
    pub fn new(
        queue: Arc<PriorityQueue>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let poller = Arc::new(StatusPoller::new(queue.store().clone(), sink));
        Self { queue, poller }
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn poller(&self) -> &Arc<StatusPoller> {
        &self.poller
    }

    pub fn submit(
        &self,
        units: Vec<Bytes>,
        printer_ref: &str,
        priority: Option<Priority>,
    ) -> Result<JobId, SubmitError> {
        self.queue.submit(units, printer_ref, priority)
    }

    /// Reports status and fires the terminal notification if this is the
    /// first time the job is seen finished.
    pub fn status(&self, id: &JobId) -> Result<JobStatusView, JobError> {
        self.poller.poll(id)
    }

    /// Stops a job. One that hasn't started is cancelled on the spot; one
    /// that's printing stops at the next unit boundary, after the unit in
    /// flight has finished.
    pub fn cancel(&self, id: &JobId) -> Result<(), JobError> {
        let mut refused = false;
        let mut withdrawn = false;

        self.queue.store().update(id, &mut |j| {
            use JobStatus::*;

            refused = false;
            withdrawn = false;
            match j.status {
                Completed | Failed | Cancelled => refused = true,
                Pending | Queued => {
                    j.mark_failed_from(1);
                    j.advance(Cancelled)?;
                    withdrawn = true;
                },
                Sent | Printing => j.cancel_requested = true,
            }
            Ok(())
        })?;

        if refused {
            return Err(JobError::NotCancellable(*id));
        }
        if withdrawn {
            self.queue.withdraw(id);
        }

        info!(%id, immediate = withdrawn, "cancel requested");
        Ok(())
    }

    pub fn resume(&self, id: &JobId) -> Result<JobId, JobError> {
        resume::resume(&self.queue, id)
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }
}
