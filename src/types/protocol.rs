use serde::Serialize;
use tracing::error;

use super::job::JobId;
use super::serialisable::WireSerialisable;
use super::view::{JobStatusView, QueueStats};
use crate::error::{JobError, SubmitError};

/// A command sent by the client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SpoolCommand {
    /// Admits a job of `count` units for `printer`. The command line is
    /// followed by `count` chunks, each a `<n_bytes>` line then that many
    /// bytes of payload and a CRLF. Priority is `normal` when omitted.
    ///
    /// On the wire: `submit <printer> <count> [<priority>]`
    Submit {
        printer: Vec<u8>,
        count: u32,
        priority: Option<Vec<u8>>,
    },
    /// Reports a job's state and progress as a YAML document.
    ///
    /// On the wire: `status <id>`
    Status { id: JobId },
    /// Cancels a job. A running job stops after the unit in flight.
    ///
    /// On the wire: `cancel <id>`
    Cancel { id: JobId },
    /// Queues a high-priority job holding only the units `id` failed to
    /// print.
    ///
    /// On the wire: `resume <id>`
    Resume { id: JobId },
    /// Reports lane depths and job counts by state.
    ///
    /// On the wire: `stats`
    Stats,
    /// Requests that the server close this connection.
    ///
    /// On the wire: `quit`
    Quit,
}

/// All possible responses to a `SpoolCommand`.
#[derive(Clone, Debug, PartialEq)]
pub enum SpoolResponse {
    /// Indicates a server bug. Can be sent in response to any command.
    ///
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
    /// The command line was malformed: a missing or non-numeric argument, an
    /// unparseable job id, or trailing input.
    ///
    /// On the wire: `BAD_FORMAT`.
    BadFormat,
    /// On the wire: `UNKNOWN_COMMAND`.
    UnknownCommand,
    /// In response to a `submit`, a unit's payload wasn't followed by CRLF.
    ///
    /// On the wire: `EXPECTED_CRLF`.
    ExpectedCrlf,
    /// In response to a `submit`, the job was admitted.
    ///
    /// On the wire: `SUBMITTED <id>`.
    Submitted { id: JobId },
    /// On the wire: `INVALID_PRIORITY`.
    InvalidPriority,
    /// In response to a `submit` with a count of zero.
    ///
    /// On the wire: `EMPTY_JOB`.
    EmptyJob,
    /// In response to a `submit` whose printer name is blank.
    ///
    /// On the wire: `MISSING_PRINTER`.
    MissingPrinter,
    /// In response to a `submit` naming a printer the server doesn't drive.
    ///
    /// On the wire: `UNKNOWN_PRINTER`.
    UnknownPrinter,
    /// In response to a `submit` with more units than the server accepts in
    /// one job. The server closes the connection after sending this.
    ///
    /// On the wire: `JOB_TOO_BIG`.
    JobTooBig,
    /// In response to a `submit`, a unit exceeded the configured size limit.
    /// The server closes the connection after sending this.
    ///
    /// On the wire: `UNIT_TOO_BIG`.
    UnitTooBig,
    /// In response to a `status`.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStatus { data: JobStatusView },
    /// In response to a `stats`.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStats { data: QueueStats },
    /// The job id isn't known to the server.
    ///
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// On the wire: `CANCELLED`.
    Cancelled,
    /// In response to a `cancel` on a job that has already finished.
    ///
    /// On the wire: `NOT_CANCELLABLE`.
    NotCancellable,
    /// In response to a `resume`, gives the id of the follow-up job.
    ///
    /// On the wire: `RESUMED <id>`.
    Resumed { id: JobId },
    /// In response to a `resume` on a job that is still running or has no
    /// failed units.
    ///
    /// On the wire: `NOT_RESUMABLE`.
    NotResumable,
}

impl From<SubmitError> for SpoolResponse {
    fn from(value: SubmitError) -> Self {
        match value {
            SubmitError::InvalidPriority(_) => Self::InvalidPriority,
            SubmitError::EmptyJob => Self::EmptyJob,
            SubmitError::MissingPrinter => Self::MissingPrinter,
            SubmitError::UnknownPrinter(_) => Self::UnknownPrinter,
            SubmitError::TooManyUnits { .. } => Self::JobTooBig,
            SubmitError::UnitTooLarge { .. } => Self::UnitTooBig,
            SubmitError::Store(error) => {
                error!(%error, "store rejected submission");
                Self::InternalError
            },
        }
    }
}

impl From<JobError> for SpoolResponse {
    fn from(value: JobError) -> Self {
        match value {
            JobError::NotFound(_) => Self::NotFound,
            JobError::NotResumable(_) => Self::NotResumable,
            JobError::NotCancellable(_) => Self::NotCancellable,
            JobError::Submit(error) => error.into(),
            error @ (JobError::DeadlineExceeded(_) | JobError::Store(_)) => {
                error!(%error, "job operation failed");
                Self::InternalError
            },
        }
    }
}

/// Renders `OK <n_bytes>\r\n<yaml>\r\n`.
fn ok_yaml<T: Serialize>(data: &T) -> Vec<u8> {
    match serde_yaml::to_string(data) {
        Ok(data) => format!("OK {}\r\n{data}\r\n", data.len()).into(),
        Err(error) => {
            error!(%error, "failed to serialise response");
            b"INTERNAL_ERROR\r\n".to_vec()
        },
    }
}

impl WireSerialisable for SpoolResponse {
    fn serialise_wire(&self) -> Vec<u8> {
        use SpoolResponse::*;

        match self {
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
            BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
            ExpectedCrlf => b"EXPECTED_CRLF\r\n".to_vec(),
            Submitted { id } => format!("SUBMITTED {id}\r\n").into(),
            InvalidPriority => b"INVALID_PRIORITY\r\n".to_vec(),
            EmptyJob => b"EMPTY_JOB\r\n".to_vec(),
            MissingPrinter => b"MISSING_PRINTER\r\n".to_vec(),
            UnknownPrinter => b"UNKNOWN_PRINTER\r\n".to_vec(),
            JobTooBig => b"JOB_TOO_BIG\r\n".to_vec(),
            UnitTooBig => b"UNIT_TOO_BIG\r\n".to_vec(),
            OkStatus { data } => ok_yaml(data),
            OkStats { data } => ok_yaml(data),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            Cancelled => b"CANCELLED\r\n".to_vec(),
            NotCancellable => b"NOT_CANCELLABLE\r\n".to_vec(),
            Resumed { id } => format!("RESUMED {id}\r\n").into(),
            NotResumable => b"NOT_RESUMABLE\r\n".to_vec(),
        }
    }
}
