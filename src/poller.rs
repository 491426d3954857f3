//! Read path for job status, and the one-shot terminal notification.
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::store::JobStore;
use crate::types::job::{Job, JobId};
use crate::types::states::JobStatus;
use crate::types::view::JobStatusView;

/// Sent once per job, the first time it's seen in a terminal state.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub job_id: JobId,
    pub status: JobStatus,
    pub summary: String,
}

impl Notification {
    fn for_job(job: &Job) -> Self {
        let n = job.quantity();
        let missed = job.failed_units.len();

        let summary = match job.status {
            JobStatus::Completed => format!("{n} of {n} labels printed"),
            JobStatus::Failed => match &job.error_message {
                Some(error) => format!("Job {} failed: {error}", job.id),
                None => format!(
                    "Job {} failed: {missed} of {n} labels not printed",
                    job.id
                ),
            },
            _ => format!(
                "Job {} {}: {missed} of {n} labels not printed",
                job.id, job.status
            ),
        };

        Self {
            job_id: job.id,
            status: job.status,
            summary,
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, n: Notification) {
        match n.status {
            JobStatus::Completed => {
                info!(job = %n.job_id, summary = %n.summary, "print job completed")
            },
            status => {
                warn!(job = %n.job_id, %status, summary = %n.summary, "print job ended")
            },
        }
    }
}

/// Forwards notifications to a channel, for callers that want to react to
/// them in their own task.
#[derive(Clone, Debug)]
pub struct ChannelSink(pub mpsc::UnboundedSender<Notification>);

impl NotificationSink for ChannelSink {
    fn notify(&self, n: Notification) {
        if self.0.send(n).is_err() {
            debug!("notification receiver gone");
        }
    }
}

pub struct StatusPoller {
    store: Arc<dyn JobStore>,
    sink: Arc<dyn NotificationSink>,
}

impl StatusPoller {
    pub fn new(store: Arc<dyn JobStore>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { store, sink }
    }

    /// Pure read of the job's current state.
    pub fn status(&self, id: &JobId) -> Result<JobStatusView, JobError> {
        self.store
            .get(id)
            .map(|job| job.view())
            .ok_or(JobError::NotFound(*id))
    }

    /// Reads status, and if this is the first time the job has been seen in a
    /// terminal state, notifies the sink. Safe to call any number of times.
    pub fn poll(&self, id: &JobId) -> Result<JobStatusView, JobError> {
        let view = self.status(id)?;

        if view.status.is_terminal() && self.store.take_notification(id)? {
            // Re-read so the summary reflects the committed record.
            if let Some(job) = self.store.get(id) {
                self.sink.notify(Notification::for_job(&job));
            }
        }

        Ok(view)
    }

    /// Polls every `every` until the job is terminal, giving up after
    /// `deadline`.
    pub async fn poll_until_terminal(
        &self,
        id: &JobId,
        every: Duration,
        deadline: Duration,
    ) -> Result<JobStatusView, JobError> {
        let wait = async {
            loop {
                let view = self.poll(id)?;
                if view.status.is_terminal() {
                    return Ok::<_, JobError>(view);
                }
                sleep(every).await;
            }
        };

        timeout(deadline, wait)
            .await
            .map_err(|_| JobError::DeadlineExceeded(*id))?
    }

    /// Polls every job that hasn't been announced yet. Returns how many
    /// notifications went out.
    pub fn sweep(&self) -> usize {
        let mut sent = 0;

        for id in self.store.ids() {
            let Some(job) = self.store.get(&id) else {
                continue;
            };
            if job.notified || !job.status.is_terminal() {
                continue;
            }

            match self.store.take_notification(&id) {
                Ok(true) => {
                    if let Some(job) = self.store.get(&id) {
                        self.sink.notify(Notification::for_job(&job));
                        sent += 1;
                    }
                },
                Ok(false) => {},
                Err(error) => warn!(job = %id, %error, "sweep failed"),
            }
        }

        sent
    }

    /// Sweeps on a fixed period until `shutdown` fires, so terminal jobs are
    /// announced even if no client polls them.
    pub async fn run_sweeper(
        self: Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticks.tick() => {
                    let sent = self.sweep();
                    if sent > 0 {
                        debug!(sent, "sweep sent notifications");
                    }
                },
                _ = shutdown.cancelled() => break,
            }
        }

        // Catch anything that finished during shutdown.
        self.sweep();
    }
}
