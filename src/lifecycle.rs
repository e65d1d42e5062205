//! Job and step lifecycle notifications

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::errors::{DecodeError, LaneError};
use crate::lane::{LaneId, StepSummary};

/// Terminal status of a lane or of the whole job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Completed,
    Failed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Completed => write!(f, "COMPLETED"),
            Status::Failed => write!(f, "FAILED"),
        }
    }
}

/// Observer of pipeline progress.
///
/// All methods default to no-ops. Implementations must not block for long;
/// they run inline on the lane's task. A panic inside a callback is caught
/// and logged, it never changes the outcome of a lane or job.
pub trait LifecycleReporter: Send + Sync {
    fn on_job_start(&self, _lanes: usize) {}

    fn on_job_complete(&self, _status: Status, _duration: Duration) {}

    fn on_step_start(&self, _lane: LaneId) {}

    fn on_chunk_commit(&self, _lane: LaneId, _seq: usize, _records: usize) {}

    fn on_decode_error(&self, _lane: LaneId, _line: u64, _error: &DecodeError) {}

    fn on_step_complete(
        &self,
        _lane: LaneId,
        _status: Status,
        _summary: &StepSummary,
        _error: Option<&LaneError>,
    ) {
    }
}

/// Invoke a reporter callback, containing any panic it raises
pub(crate) fn notify<F>(callback: &str, f: F)
where
    F: FnOnce(),
{
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("Lifecycle reporter panicked in {}, ignoring", callback);
    }
}

/// Reports lifecycle events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl LifecycleReporter for TracingReporter {
    fn on_job_start(&self, lanes: usize) {
        info!("Job started with {} lanes", lanes);
    }

    fn on_job_complete(&self, status: Status, duration: Duration) {
        match status {
            Status::Completed => info!(
                "Job finished with status {} in {} ms",
                status,
                duration.as_millis()
            ),
            Status::Failed => error!(
                "Job finished with status {} in {} ms",
                status,
                duration.as_millis()
            ),
        }
    }

    fn on_step_start(&self, lane: LaneId) {
        info!("Step {} started", lane);
    }

    fn on_chunk_commit(&self, lane: LaneId, seq: usize, records: usize) {
        debug!("{} committed chunk {} with {} records", lane, seq, records);
    }

    fn on_decode_error(&self, lane: LaneId, line: u64, error: &DecodeError) {
        warn!("{} skipped line {}: {}", lane, line, error);
    }

    fn on_step_complete(
        &self,
        lane: LaneId,
        status: Status,
        summary: &StepSummary,
        error: Option<&LaneError>,
    ) {
        match error {
            None => info!(
                "Step {} {}: read={} written={} skipped={} chunks={}",
                lane,
                status,
                summary.lines_read,
                summary.records_written,
                summary.decode_errors,
                summary.chunks_written
            ),
            Some(e) => error!(
                "Step {} {}: read={} written={} skipped={} chunks={}: {}",
                lane,
                status,
                summary.lines_read,
                summary.records_written,
                summary.decode_errors,
                summary.chunks_written,
                e
            ),
        }
    }
}
