use std::fmt;

use serde::Serialize;

/// Lifecycle of a print job. States only ever move forward; see
/// [`JobStatus::can_advance_to`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum JobStatus {
    Pending,
    Queued,
    Sent,
    Printing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Sent,
        JobStatus::Printing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `to`.
    ///
    /// `Sent -> Failed` covers a printer found stopped before the first unit
    /// is attempted. Cancellation is reachable from every non-terminal state.
    pub fn can_advance_to(self, to: JobStatus) -> bool {
        use JobStatus::*;

        match (self, to) {
            (Pending, Queued) => true,
            (Queued, Sent) => true,
            (Sent, Printing) | (Sent, Failed) => true,
            (Printing, Completed) | (Printing, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        use JobStatus::*;

        match self {
            Pending => "pending",
            Queued => "queued",
            Sent => "sent",
            Printing => "printing",
            Completed => "completed",
            Failed => "failed",
            Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Lets status views be serialised to YAML.
impl Serialize for JobStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}
