//! A single read-decode-buffer-write pipeline

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::chunk::{Chunk, ChunkBuffer};
use crate::errors::{LaneError, WriteError};
use crate::lifecycle::{notify, LifecycleReporter, Status};
use crate::models::VehicleRecord;
use crate::sink::RecordSink;
use crate::source::SourceProvider;

/// 1-based lane number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LaneId(usize);

impl LaneId {
    /// Create a lane id from its 1-based number; zero is clamped to one.
    pub fn new(number: usize) -> Self {
        Self(number.max(1))
    }

    pub fn number(&self) -> usize {
        self.0
    }

    /// 0-based position, used for partitioning
    pub fn index(&self) -> usize {
        self.0 - 1
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lane-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    Idle,
    Reading,
    Decoding,
    Flushing,
    Completed,
    Failed,
}

/// Step counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    pub lines_read: u64,
    pub records_decoded: u64,
    pub decode_errors: u64,
    pub chunks_written: u64,
    pub records_written: u64,
}

impl StepSummary {
    pub(crate) fn merge(&mut self, other: &StepSummary) {
        self.lines_read += other.lines_read;
        self.records_decoded += other.records_decoded;
        self.decode_errors += other.decode_errors;
        self.chunks_written += other.chunks_written;
        self.records_written += other.records_written;
    }
}

/// Collaborators shared by every lane of a job
#[derive(Clone)]
pub struct LaneContext {
    pub provider: Arc<dyn SourceProvider>,
    pub sink: Arc<dyn RecordSink>,
    pub reporter: Arc<dyn LifecycleReporter>,
    pub chunk_size: usize,
    pub lanes: usize,
    /// Raised to stop lanes before their next read
    pub stop: Arc<AtomicBool>,
    /// Raise `stop` when this lane fails
    pub fail_fast: bool,
}

/// Final state of a lane after `run`
#[derive(Debug)]
pub struct LaneOutcome {
    pub id: LaneId,
    pub state: LaneState,
    pub summary: StepSummary,
    pub error: Option<LaneError>,
    pub duration: Duration,
}

impl LaneOutcome {
    pub fn status(&self) -> Status {
        match self.state {
            LaneState::Completed => Status::Completed,
            _ => Status::Failed,
        }
    }
}

pub struct Lane {
    id: LaneId,
    ctx: LaneContext,
    state: LaneState,
    summary: StepSummary,
}

impl Lane {
    pub fn new(id: LaneId, ctx: LaneContext) -> Self {
        Self {
            id,
            ctx,
            state: LaneState::Idle,
            summary: StepSummary::default(),
        }
    }

    /// Drive the lane to `Completed` or `Failed`.
    ///
    /// Decode failures are skipped and counted. The first write or source
    /// error ends the lane; nothing is read after it.
    pub async fn run(mut self) -> LaneOutcome {
        let started = Instant::now();
        let id = self.id;
        let reporter = self.ctx.reporter.clone();
        notify("on_step_start", || reporter.on_step_start(id));

        let error = match self.execute().await {
            Ok(()) => {
                self.state = LaneState::Completed;
                None
            }
            Err(e) => {
                self.state = LaneState::Failed;
                if self.ctx.fail_fast && !matches!(e, LaneError::Aborted) {
                    self.ctx.stop.store(true, Ordering::SeqCst);
                }
                Some(e)
            }
        };

        let outcome = LaneOutcome {
            id,
            state: self.state,
            summary: self.summary,
            error,
            duration: started.elapsed(),
        };
        notify("on_step_complete", || {
            reporter.on_step_complete(
                id,
                outcome.status(),
                &outcome.summary,
                outcome.error.as_ref(),
            )
        });
        outcome
    }

    async fn execute(&mut self) -> Result<(), LaneError> {
        let mut source = self.ctx.provider.open(self.id, self.ctx.lanes).await?;
        let mut buffer = ChunkBuffer::new(self.ctx.chunk_size);

        loop {
            if self.ctx.stop.load(Ordering::SeqCst) {
                debug!("{} stopping, {} records not flushed", self.id, buffer.pending());
                return Err(LaneError::Aborted);
            }

            self.state = LaneState::Reading;
            let Some(line) = source.next_line().await? else {
                break;
            };
            self.summary.lines_read += 1;

            self.state = LaneState::Decoding;
            match VehicleRecord::decode(&line.text) {
                Ok(record) => {
                    self.summary.records_decoded += 1;
                    if let Some(chunk) = buffer.push(record) {
                        self.flush(chunk).await?;
                    }
                }
                Err(e) => {
                    self.summary.decode_errors += 1;
                    let reporter = &self.ctx.reporter;
                    let id = self.id;
                    notify("on_decode_error", || {
                        reporter.on_decode_error(id, line.number, &e)
                    });
                }
            }
        }

        if let Some(chunk) = buffer.finish() {
            self.flush(chunk).await?;
        }
        Ok(())
    }

    async fn flush(&mut self, chunk: Chunk) -> Result<(), LaneError> {
        self.state = LaneState::Flushing;
        let seq = chunk.seq;
        let expected = chunk.len();

        let ids = self
            .ctx
            .sink
            .write_batch(chunk)
            .await
            .map_err(|source| LaneError::Write { chunk: seq, source })?;
        if ids.len() != expected {
            return Err(LaneError::Write {
                chunk: seq,
                source: WriteError::IdCountMismatch {
                    expected,
                    returned: ids.len(),
                },
            });
        }

        self.summary.chunks_written += 1;
        self.summary.records_written += expected as u64;
        let reporter = &self.ctx.reporter;
        let id = self.id;
        notify("on_chunk_commit", || {
            reporter.on_chunk_commit(id, seq, expected)
        });
        Ok(())
    }
}
