//! Fan-out of lanes under a concurrency cap

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::errors::{LaneError, SchedulerError};
use crate::lane::{Lane, LaneContext, LaneId, LaneOutcome, LaneState, StepSummary};
use crate::lifecycle::{notify, LifecycleReporter, Status, TracingReporter};
use crate::sink::RecordSink;
use crate::source::SourceProvider;

/// Per-lane line of the job report
#[derive(Debug, Clone, Serialize)]
pub struct LaneReport {
    pub lane: LaneId,
    pub status: Status,
    pub summary: StepSummary,
    pub error: Option<String>,
    pub duration_ms: u128,
}

/// Outcome of a whole job
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub status: Status,
    pub duration_ms: u128,
    pub totals: StepSummary,
    pub lanes: Vec<LaneReport>,
}

/// Launches `lanes` identical lanes, at most `concurrency` at a time
pub struct FanOutScheduler {
    config: PipelineConfig,
    provider: Arc<dyn SourceProvider>,
    sink: Arc<dyn RecordSink>,
    reporter: Arc<dyn LifecycleReporter>,
}

impl FanOutScheduler {
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn SourceProvider>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            config,
            provider,
            sink,
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn LifecycleReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Run every lane to a terminal state.
    ///
    /// Returns the report when all lanes completed, otherwise an error
    /// listing each failed lane. A failing lane does not stop its siblings
    /// unless `fail_fast` is set.
    pub async fn run(&self) -> Result<JobReport, SchedulerError> {
        let lanes = self.config.lanes.max(1);
        let concurrency = self.config.concurrency.max(1);
        let started = Instant::now();

        info!(
            "Starting {} lanes with concurrency={} chunk_size={} fail_fast={}",
            lanes, concurrency, self.config.chunk_size, self.config.fail_fast
        );
        let reporter = self.reporter.clone();
        notify("on_job_start", || reporter.on_job_start(lanes));

        let ctx = LaneContext {
            provider: self.provider.clone(),
            sink: self.sink.clone(),
            reporter: self.reporter.clone(),
            chunk_size: self.config.chunk_size,
            lanes,
            stop: Arc::new(AtomicBool::new(false)),
            fail_fast: self.config.fail_fast,
        };

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut handles: Vec<(LaneId, JoinHandle<LaneOutcome>)> = Vec::with_capacity(lanes);
        for number in 1..=lanes {
            let id = LaneId::new(number);
            // Wait for a free slot before spawning, so at most `concurrency`
            // lane tasks exist at once
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                error!("Lane slots closed, {} not started", id);
                break;
            };
            debug!("{} acquired a slot", id);
            let lane = Lane::new(id, ctx.clone());
            handles.push((
                id,
                tokio::spawn(async move {
                    let outcome = lane.run().await;
                    drop(permit);
                    outcome
                }),
            ));
        }

        let mut outcomes = Vec::with_capacity(lanes);
        for (id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => self.lost_lane(id, e),
            };
            outcomes.push(outcome);
        }

        let duration = started.elapsed();
        let report = Self::report(&outcomes, duration);
        let reporter = self.reporter.clone();
        notify("on_job_complete", || {
            reporter.on_job_complete(report.status, duration)
        });

        let failures: Vec<(LaneId, LaneError)> = outcomes
            .into_iter()
            .filter_map(|o| o.error.map(|e| (o.id, e)))
            .collect();
        if failures.is_empty() {
            info!(
                "All {} lanes completed in {:.3}s, {} records written",
                lanes,
                duration.as_secs_f64(),
                report.totals.records_written
            );
            Ok(report)
        } else {
            error!(
                "{} of {} lanes failed after {:.3}s",
                failures.len(),
                lanes,
                duration.as_secs_f64()
            );
            Err(SchedulerError {
                failures,
                duration,
                report,
            })
        }
    }

    /// Outcome for a lane whose task panicked or was cancelled
    fn lost_lane(&self, id: LaneId, e: tokio::task::JoinError) -> LaneOutcome {
        let message = if e.is_panic() {
            let payload = e.into_panic();
            if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            }
        } else {
            e.to_string()
        };
        error!("{} task ended abnormally: {}", id, message);

        let outcome = LaneOutcome {
            id,
            state: LaneState::Failed,
            summary: StepSummary::default(),
            error: Some(LaneError::Panicked(message)),
            duration: Duration::ZERO,
        };
        let reporter = self.reporter.clone();
        notify("on_step_complete", || {
            reporter.on_step_complete(
                id,
                Status::Failed,
                &outcome.summary,
                outcome.error.as_ref(),
            )
        });
        outcome
    }

    fn report(outcomes: &[LaneOutcome], duration: Duration) -> JobReport {
        let mut totals = StepSummary::default();
        let lanes: Vec<LaneReport> = outcomes
            .iter()
            .map(|o| {
                totals.merge(&o.summary);
                LaneReport {
                    lane: o.id,
                    status: o.status(),
                    summary: o.summary.clone(),
                    error: o.error.as_ref().map(ToString::to_string),
                    duration_ms: o.duration.as_millis(),
                }
            })
            .collect();
        let status = if lanes.iter().all(|l| l.status == Status::Completed) {
            Status::Completed
        } else {
            Status::Failed
        };

        JobReport {
            status,
            duration_ms: duration.as_millis(),
            totals,
            lanes,
        }
    }
}
