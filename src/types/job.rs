use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::states::JobStatus;
use super::view::JobStatusView;
use crate::error::{StoreError, SubmitError};

/// Opaque job identifier. Random 128-bit values, so ids handed out to callers
/// can't be guessed from one another.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Which lane a job waits in.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Lanes in the order they are drained.
    pub const LANES: [Priority; 3] =
        [Priority::High, Priority::Normal, Priority::Low];

    pub(crate) fn lane(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

impl FromStr for Priority {
    type Err = SubmitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(SubmitError::InvalidPriority(other.to_owned())),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        })
    }
}

/// A batch of label units bound for a single printer.
///
/// Units are indexed from 1 in everything the job exposes (`current_unit`,
/// `failed_units`), matching box numbering on the printed labels.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub printer_ref: String,
    pub units: Arc<[Bytes]>,
    pub priority: Priority,
    pub status: JobStatus,
    /// Last unit attempted, 0 before the first attempt.
    pub current_unit: usize,
    /// Ascending, no duplicates.
    pub failed_units: Vec<usize>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set by `cancel` while a worker owns the job; checked between units.
    pub cancel_requested: bool,
    /// One-shot flag guarding the terminal notification.
    pub notified: bool,
    pub resumed_from: Option<JobId>,
}

impl Job {
    pub(crate) fn new(
        printer_ref: String,
        units: Vec<Bytes>,
        priority: Priority,
        resumed_from: Option<JobId>,
    ) -> Self {
        Self {
            id: JobId::generate(),
            printer_ref,
            units: units.into(),
            priority,
            status: JobStatus::Pending,
            current_unit: 0,
            failed_units: Vec::new(),
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
            cancel_requested: false,
            notified: false,
            resumed_from,
        }
    }

    pub fn quantity(&self) -> usize {
        self.units.len()
    }

    pub fn progress_percent(&self) -> f64 {
        match self.quantity() {
            0 => 0.0,
            n => self.current_unit as f64 / n as f64 * 100.0,
        }
    }

    /// Payload for the 1-based unit `index`.
    pub fn unit(&self, index: usize) -> Option<&Bytes> {
        index.checked_sub(1).and_then(|i| self.units.get(i))
    }

    /// Moves the job to `to`, stamping `completed_at` on terminal states.
    pub fn advance(&mut self, to: JobStatus) -> Result<(), StoreError> {
        if !self.status.can_advance_to(to) {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }

        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }

        Ok(())
    }

    /// Records that unit `index` has been attempted. Never moves backwards.
    pub fn record_attempt(&mut self, index: usize) {
        self.current_unit = self.current_unit.max(index.min(self.quantity()));
    }

    /// Adds `index` to `failed_units` if it's in range and not yet present.
    pub fn mark_failed(&mut self, index: usize) {
        if index == 0 || index > self.quantity() {
            return;
        }

        if let Err(pos) = self.failed_units.binary_search(&index) {
            self.failed_units.insert(pos, index);
        }
    }

    /// Marks every unit from `from` to the end as failed. Used when a job is
    /// cut short so the untried units can be resumed later.
    pub fn mark_failed_from(&mut self, from: usize) {
        for index in from.max(1)..=self.quantity() {
            self.mark_failed(index);
        }
    }

    /// Human-readable progress, e.g. `12 of 200`.
    pub fn progress_display(&self) -> String {
        match self.status {
            JobStatus::Printing => {
                format!("{} of {}", self.current_unit, self.quantity())
            },
            JobStatus::Completed => {
                format!("{0} of {0}", self.quantity())
            },
            _ => "-".to_owned(),
        }
    }

    pub fn view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id,
            printer_ref: self.printer_ref.clone(),
            priority: self.priority,
            status: self.status,
            current_unit: self.current_unit,
            quantity: self.quantity(),
            progress_percent: self.progress_percent(),
            progress_display: self.progress_display(),
            failed_units: self.failed_units.clone(),
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
            resumed_from: self.resumed_from,
        }
    }
}
