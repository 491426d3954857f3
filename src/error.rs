//! Error types surfaced by the spooler's public operations.
use thiserror::Error;

use crate::types::job::JobId;
use crate::types::states::JobStatus;

/// Persistence-level failures.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} already exists")]
    Duplicate(JobId),
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Admission failures. No job is created when `submit` returns one of these.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum SubmitError {
    #[error("invalid priority: {0:?}")]
    InvalidPriority(String),
    #[error("job has no units")]
    EmptyJob,
    #[error("job has no printer")]
    MissingPrinter,
    #[error("printer {0:?} is not configured")]
    UnknownPrinter(String),
    #[error("job has {count} units, over the {limit} unit limit")]
    TooManyUnits { count: usize, limit: usize },
    #[error("unit {index} is {size} bytes, over the {limit} byte limit")]
    UnitTooLarge {
        index: usize,
        size: usize,
        limit: usize,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of operations that address an existing job.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} has no failed units to resume or is still running")]
    NotResumable(JobId),
    #[error("job {0} has already finished")]
    NotCancellable(JobId),
    #[error("gave up waiting for job {0} to finish")]
    DeadlineExceeded(JobId),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for JobError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Failures loading the YAML configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("printer {name:?} has invalid address {addr:?}")]
    InvalidPrinterAddr { name: String, addr: String },
}
