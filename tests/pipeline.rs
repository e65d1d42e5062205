use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;

use vehicle_ingest::{
    chunk::Chunk,
    config::PipelineConfig,
    errors::{DecodeError, DecodeErrorKind, LaneError, WriteError},
    lane::{LaneId, StepSummary},
    lifecycle::{LifecycleReporter, Status},
    models::{RecordId, VehicleRecord},
    scheduler::FanOutScheduler,
    sink::RecordSink,
    source::{FileSourceProvider, MemorySourceProvider, ReadPolicy},
};

/// Stores chunks in memory and fails chosen calls per lane.
///
/// Lanes are recognised by the `vehicle_id` column, which the test input
/// sets to the lane that owns the line under partitioned reads.
#[derive(Default)]
struct MemorySink {
    next_id: AtomicUsize,
    stored: Mutex<Vec<VehicleRecord>>,
    calls: Mutex<HashMap<String, usize>>,
    fail: Option<(String, usize)>,
}

impl MemorySink {
    fn failing(vehicle: &str, call: usize) -> Self {
        Self {
            fail: Some((vehicle.to_string(), call)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write_batch(&self, chunk: Chunk) -> Result<Vec<RecordId>, WriteError> {
        let owner = chunk.records[0].vehicle_id.clone();
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(owner.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if let Some((vehicle, n)) = &self.fail {
            if *vehicle == owner && *n == call {
                return Err(WriteError::Rejected(format!("{} call {}", owner, call)));
            }
        }

        tokio::time::sleep(Duration::from_millis(1)).await;

        let mut stored = self.stored.lock().unwrap();
        let mut ids = Vec::with_capacity(chunk.len());
        for mut record in chunk.records {
            let id = RecordId::from(self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1);
            record.id = Some(id);
            stored.push(record);
            ids.push(id);
        }
        Ok(ids)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    JobStart(usize),
    JobComplete(Status),
    StepStart(LaneId),
    ChunkCommit(LaneId, usize, usize),
    DecodeError(LaneId, u64, DecodeErrorKind),
    StepComplete(LaneId, Status, u64),
}

#[derive(Default)]
struct RecordingReporter {
    events: Mutex<Vec<Event>>,
}

impl RecordingReporter {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| f(e)).count()
    }
}

impl LifecycleReporter for RecordingReporter {
    fn on_job_start(&self, lanes: usize) {
        self.events.lock().unwrap().push(Event::JobStart(lanes));
    }

    fn on_job_complete(&self, status: Status, _duration: Duration) {
        self.events.lock().unwrap().push(Event::JobComplete(status));
    }

    fn on_step_start(&self, lane: LaneId) {
        self.events.lock().unwrap().push(Event::StepStart(lane));
    }

    fn on_chunk_commit(&self, lane: LaneId, seq: usize, records: usize) {
        self.events
            .lock()
            .unwrap()
            .push(Event::ChunkCommit(lane, seq, records));
    }

    fn on_decode_error(&self, lane: LaneId, line: u64, error: &DecodeError) {
        self.events
            .lock()
            .unwrap()
            .push(Event::DecodeError(lane, line, error.kind));
    }

    fn on_step_complete(
        &self,
        lane: LaneId,
        status: Status,
        summary: &StepSummary,
        _error: Option<&LaneError>,
    ) {
        self.events
            .lock()
            .unwrap()
            .push(Event::StepComplete(lane, status, summary.lines_read));
    }
}

struct PanickingReporter;

impl LifecycleReporter for PanickingReporter {
    fn on_step_start(&self, _lane: LaneId) {
        panic!("reporter failure");
    }

    fn on_job_complete(&self, _status: Status, _duration: Duration) {
        panic!("reporter failure");
    }
}

/// `lines` records; line `i` belongs to lane `i % lanes + 1` when partitioned
fn input(lines: usize, lanes: usize) -> Vec<String> {
    (0..lines)
        .map(|i| {
            format!(
                "{},L1,I,JP1,2023-01-01,VJ1,OP1,0,-6.2,53.3,,B1,V{},S1,1",
                1_000 + i,
                i % lanes + 1
            )
        })
        .collect()
}

fn pipeline(lanes: usize, concurrency: usize, chunk_size: usize) -> PipelineConfig {
    PipelineConfig {
        lanes,
        concurrency,
        chunk_size,
        fail_fast: false,
    }
}

#[tokio::test]
async fn ten_lanes_fire_hooks_once_each() {
    let sink = Arc::new(MemorySink::default());
    let reporter = Arc::new(RecordingReporter::default());
    let scheduler = FanOutScheduler::new(
        pipeline(10, 10, 8),
        Arc::new(MemorySourceProvider::new(
            input(200, 10),
            ReadPolicy::Partitioned,
        )),
        sink.clone(),
    )
    .with_reporter(reporter.clone());

    let report = scheduler.run().await.unwrap();

    assert_eq!(report.status, Status::Completed);
    assert_eq!(report.totals.records_written, 200);
    assert_eq!(sink.stored.lock().unwrap().len(), 200);

    let events = reporter.events();
    assert_eq!(events.first(), Some(&Event::JobStart(10)));
    assert_eq!(events.last(), Some(&Event::JobComplete(Status::Completed)));
    assert_eq!(reporter.count(|e| matches!(e, Event::JobStart(_))), 1);
    assert_eq!(reporter.count(|e| matches!(e, Event::JobComplete(_))), 1);
    assert_eq!(reporter.count(|e| matches!(e, Event::StepStart(_))), 10);
    assert_eq!(
        reporter.count(|e| matches!(e, Event::StepComplete(_, Status::Completed, _))),
        10
    );
    // 20 records per lane at chunk size 8: 8, 8, 4
    assert_eq!(reporter.count(|e| matches!(e, Event::ChunkCommit(..))), 30);
}

#[tokio::test]
async fn failing_lane_does_not_stop_siblings() {
    let sink = Arc::new(MemorySink::failing("V2", 3));
    let reporter = Arc::new(RecordingReporter::default());
    let scheduler = FanOutScheduler::new(
        pipeline(10, 10, 4),
        Arc::new(MemorySourceProvider::new(
            input(400, 10),
            ReadPolicy::Partitioned,
        )),
        sink.clone(),
    )
    .with_reporter(reporter.clone());

    let err = scheduler.run().await.unwrap_err();

    assert_eq!(err.failures.len(), 1);
    let (lane, error) = &err.failures[0];
    assert_eq!(*lane, LaneId::new(2));
    assert!(matches!(error, LaneError::Write { chunk: 2, .. }));

    let lane2 = &err.report.lanes[1];
    assert_eq!(lane2.status, Status::Failed);
    // Third chunk filled on the 12th line, nothing read after the failure
    assert_eq!(lane2.summary.lines_read, 12);
    assert_eq!(lane2.summary.records_written, 8);

    for lane in err.report.lanes.iter().filter(|l| l.lane != LaneId::new(2)) {
        assert_eq!(lane.status, Status::Completed);
        assert_eq!(lane.summary.records_written, 40);
    }
    assert_eq!(sink.stored.lock().unwrap().len(), 9 * 40 + 8);

    assert_eq!(
        reporter.count(|e| matches!(e, Event::StepComplete(_, Status::Failed, _))),
        1
    );
    assert_eq!(reporter.count(|e| matches!(e, Event::StepComplete(..))), 10);
    assert_eq!(
        reporter.events().last(),
        Some(&Event::JobComplete(Status::Failed))
    );
    assert!(err.to_string().contains("lane-2"));
}

#[tokio::test]
async fn fail_fast_aborts_remaining_lanes() {
    let sink = Arc::new(MemorySink::failing("V1", 1));
    let scheduler = FanOutScheduler::new(
        PipelineConfig {
            fail_fast: true,
            ..pipeline(4, 1, 2)
        },
        Arc::new(MemorySourceProvider::new(
            input(40, 4),
            ReadPolicy::Partitioned,
        )),
        sink.clone(),
    );

    let err = scheduler.run().await.unwrap_err();

    assert_eq!(err.failures.len(), 4);
    assert!(matches!(err.failures[0].1, LaneError::Write { .. }));
    assert!(err.failures[1..]
        .iter()
        .all(|(_, e)| matches!(e, LaneError::Aborted)));
    assert!(sink.stored.lock().unwrap().is_empty());
}

#[tokio::test]
async fn fewer_slots_than_lanes_completes() {
    let sink = Arc::new(MemorySink::default());
    let scheduler = FanOutScheduler::new(
        pipeline(10, 3, 5),
        Arc::new(MemorySourceProvider::new(
            input(101, 10),
            ReadPolicy::Partitioned,
        )),
        sink.clone(),
    );

    let report = tokio::time::timeout(Duration::from_secs(10), scheduler.run())
        .await
        .expect("scheduler deadlocked")
        .unwrap();

    assert_eq!(report.lanes.len(), 10);
    assert_eq!(report.totals.records_written, 101);

    let mut timestamps: Vec<i64> = sink
        .stored
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.timestamp)
        .collect();
    timestamps.sort_unstable();
    assert_eq!(timestamps, (1_000..1_101).collect::<Vec<i64>>());
}

#[tokio::test]
async fn full_pass_writes_every_line_per_lane() {
    let sink = Arc::new(MemorySink::default());
    let scheduler = FanOutScheduler::new(
        pipeline(3, 3, 10),
        Arc::new(MemorySourceProvider::new(input(25, 1), ReadPolicy::FullPass)),
        sink.clone(),
    );

    let report = scheduler.run().await.unwrap();

    assert_eq!(report.totals.records_written, 75);
    for lane in &report.lanes {
        assert_eq!(lane.summary.chunks_written, 3);
    }
}

#[tokio::test]
async fn malformed_lines_never_reach_the_sink() {
    let mut lines = input(17, 1);
    lines.insert(0, "timestamp,lineId,direction".to_string());
    lines.insert(9, "1,L1,I,JP1,2023-01-01,VJ1,OP1,maybe,0,0,,B1,V1,S1,1".to_string());

    let sink = Arc::new(MemorySink::default());
    let reporter = Arc::new(RecordingReporter::default());
    let scheduler = FanOutScheduler::new(
        pipeline(1, 1, 8),
        Arc::new(MemorySourceProvider::new(lines, ReadPolicy::Partitioned)),
        sink.clone(),
    )
    .with_reporter(reporter.clone());

    let report = scheduler.run().await.unwrap();

    assert_eq!(report.totals.decode_errors, 2);
    assert_eq!(report.totals.chunks_written, 3);
    let lane = LaneId::new(1);
    let decode_errors: Vec<Event> = reporter
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::DecodeError(..)))
        .collect();
    assert_eq!(
        decode_errors,
        vec![
            Event::DecodeError(lane, 1, DecodeErrorKind::MalformedLine),
            Event::DecodeError(lane, 10, DecodeErrorKind::InvalidBoolean),
        ]
    );
    let commits: Vec<Event> = reporter
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::ChunkCommit(..)))
        .collect();
    assert_eq!(
        commits,
        vec![
            Event::ChunkCommit(lane, 0, 8),
            Event::ChunkCommit(lane, 1, 8),
            Event::ChunkCommit(lane, 2, 1),
        ]
    );

    let stored = sink.stored.lock().unwrap();
    let expected: Vec<VehicleRecord> = input(17, 1)
        .iter()
        .map(|l| VehicleRecord::decode(l).unwrap())
        .collect();
    let without_ids: Vec<VehicleRecord> = stored
        .iter()
        .cloned()
        .map(|mut r| {
            assert!(r.id.is_some());
            r.id = None;
            r
        })
        .collect();
    assert_eq!(without_ids, expected);
}

#[tokio::test]
async fn panicking_reporter_does_not_change_outcome() {
    let scheduler = FanOutScheduler::new(
        pipeline(2, 2, 4),
        Arc::new(MemorySourceProvider::new(
            input(10, 2),
            ReadPolicy::Partitioned,
        )),
        Arc::new(MemorySink::default()),
    )
    .with_reporter(Arc::new(PanickingReporter));

    let report = scheduler.run().await.unwrap();

    assert_eq!(report.status, Status::Completed);
    assert_eq!(report.totals.records_written, 10);
}

#[tokio::test]
async fn loads_file_with_header() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "timestamp,lineId,direction,journeyPatternId,timeFrame,vehicleJourneyId,operator,congestion,longitude,latitude,delay,blockId,vehicleId,stopId,atStop"
    )
    .unwrap();
    for line in input(23, 4) {
        writeln!(file, "{}", line).unwrap();
    }

    let sink = Arc::new(MemorySink::default());
    let provider =
        FileSourceProvider::new(file.path(), ReadPolicy::Partitioned).lines_to_skip(1);
    let scheduler = FanOutScheduler::new(pipeline(4, 2, 5), Arc::new(provider), sink.clone());

    let report = scheduler.run().await.unwrap();

    assert_eq!(report.totals.lines_read, 23);
    assert_eq!(report.totals.decode_errors, 0);
    assert_eq!(report.totals.records_written, 23);
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "completed");
    assert_eq!(json["lanes"][0]["lane"], 1);
}

#[tokio::test]
async fn missing_file_fails_every_lane() {
    let scheduler = FanOutScheduler::new(
        pipeline(3, 3, 5),
        Arc::new(FileSourceProvider::new(
            "/nonexistent/vehicles.csv",
            ReadPolicy::Partitioned,
        )),
        Arc::new(MemorySink::default()),
    );

    let err = scheduler.run().await.unwrap_err();

    assert_eq!(err.failures.len(), 3);
    assert!(err
        .failures
        .iter()
        .all(|(_, e)| matches!(e, LaneError::Source(_))));
}

#[tokio::test]
async fn invalid_utf8_line_does_not_fail_lanes() {
    let lines = input(41, 4);
    let mut file = NamedTempFile::new().unwrap();
    for (i, line) in lines.iter().enumerate() {
        if i == 20 {
            let mut bytes = line.clone().into_bytes();
            // lineId "L1" becomes "L\xff1"
            bytes.splice(6..6, [0xff]);
            file.write_all(&bytes).unwrap();
            file.write_all(b"\n").unwrap();
        } else {
            writeln!(file, "{}", line).unwrap();
        }
    }

    let sink = Arc::new(MemorySink::default());
    let scheduler = FanOutScheduler::new(
        pipeline(4, 4, 5),
        Arc::new(FileSourceProvider::new(file.path(), ReadPolicy::Partitioned)),
        sink.clone(),
    );

    let report = scheduler.run().await.unwrap();

    assert_eq!(report.status, Status::Completed);
    assert_eq!(report.totals.lines_read, 41);
    assert_eq!(report.totals.records_written, 41);
    let stored = sink.stored.lock().unwrap();
    assert_eq!(
        stored.iter().filter(|r| r.line_id == "L\u{fffd}1").count(),
        1
    );
}
