//! Errors for vehicle ingestion
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::lane::LaneId;
use crate::scheduler::JobReport;

/// Top-level application error
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Problems detected before any lane is launched
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration source error: {0}")]
    Source(#[from] config::ConfigError),

    #[error("Input file not given; pass it as the first argument or set VEHICLE_INGEST__INPUT__FILE")]
    MissingInput,

    #[error("Input file {path} is not readable: {origin}")]
    UnreadableInput { path: String, origin: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Reason a raw line could not be turned into a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    MalformedLine,
    InvalidDate,
    InvalidNumber,
    InvalidBoolean,
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeErrorKind::MalformedLine => write!(f, "malformed line"),
            DecodeErrorKind::InvalidDate => write!(f, "invalid date"),
            DecodeErrorKind::InvalidNumber => write!(f, "invalid number"),
            DecodeErrorKind::InvalidBoolean => write!(f, "invalid boolean"),
        }
    }
}

/// Per-record decode failure. Never fatal to a lane.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {detail}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub detail: String,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub(crate) fn field(kind: DecodeErrorKind, field: &str, value: &str) -> Self {
        Self::new(kind, format!("field `{}` has value {:?}", field, value))
    }
}

/// Sink rejected a batch
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Database error")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Sink returned {returned} identifiers for {expected} records")]
    IdCountMismatch { expected: usize, returned: usize },

    #[error("Batch rejected: {0}")]
    Rejected(String),
}

/// Terminal failure of a single lane
#[derive(Error, Debug)]
pub enum LaneError {
    #[error("Writing chunk {chunk} failed")]
    Write {
        chunk: usize,
        #[source]
        source: WriteError,
    },

    #[error("Reading source failed")]
    Source(#[from] std::io::Error),

    #[error("Lane stopped after a sibling lane failed")]
    Aborted,

    #[error("Lane task panicked: {0}")]
    Panicked(String),
}

/// Aggregate failure: one or more lanes did not complete
#[derive(Debug)]
pub struct SchedulerError {
    pub failures: Vec<(LaneId, LaneError)>,
    pub duration: Duration,
    pub report: JobReport,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} lanes failed after {:.3}s",
            self.failures.len(),
            self.report.lanes.len(),
            self.duration.as_secs_f64()
        )?;
        for (lane, error) in &self.failures {
            write!(f, "; {}: {}", lane, error)?;
            let mut source = std::error::Error::source(error);
            while let Some(cause) = source {
                write!(f, ": {}", cause)?;
                source = cause.source();
            }
        }
        Ok(())
    }
}

impl std::error::Error for SchedulerError {}
