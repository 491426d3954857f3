use chrono::{DateTime, Utc};
use serde::Serialize;

use super::job::{JobId, Priority};
use super::states::JobStatus;

/// Snapshot of a job as reported to pollers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobStatusView {
    pub id: JobId,
    pub printer_ref: String,
    pub priority: Priority,
    pub status: JobStatus,
    /// last unit attempted
    pub current_unit: usize,
    /// total units in the job
    pub quantity: usize,
    pub progress_percent: f64,
    /// e.g. `12 of 200` while printing
    pub progress_display: String,
    /// 1-based indices of units that were not printed
    pub failed_units: Vec<usize>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// job this one reprints, if it came from a resume
    pub resumed_from: Option<JobId>,
}

/// Queue-wide counters reported by the `stats` command.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueueStats {
    /// jobs waiting in the high lane
    pub lane_high: usize,
    /// jobs waiting in the normal lane
    pub lane_normal: usize,
    /// jobs waiting in the low lane
    pub lane_low: usize,
    pub jobs_pending: usize,
    pub jobs_queued: usize,
    pub jobs_sent: usize,
    pub jobs_printing: usize,
    pub jobs_completed: usize,
    pub jobs_failed: usize,
    pub jobs_cancelled: usize,
    /// total jobs ever admitted
    pub total_jobs: usize,
}

impl QueueStats {
    pub(crate) fn count(&mut self, status: JobStatus) {
        use JobStatus::*;

        self.total_jobs += 1;
        *match status {
            Pending => &mut self.jobs_pending,
            Queued => &mut self.jobs_queued,
            Sent => &mut self.jobs_sent,
            Printing => &mut self.jobs_printing,
            Completed => &mut self.jobs_completed,
            Failed => &mut self.jobs_failed,
            Cancelled => &mut self.jobs_cancelled,
        } += 1;
    }
}
