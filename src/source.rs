//! Line sources feeding the lanes

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::lane::LaneId;

/// A raw line together with its 1-based position in the input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    pub number: u64,
    pub text: String,
}

/// Sequential supplier of lines, one cursor per lane
#[async_trait]
pub trait LineSource: Send {
    /// Next line, or `None` once the input is exhausted
    async fn next_line(&mut self) -> std::io::Result<Option<SourceLine>>;
}

/// Opens a cursor over the shared logical source for one lane
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn open(&self, lane: LaneId, lanes: usize) -> std::io::Result<Box<dyn LineSource>>;
}

/// How lanes divide the input between them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPolicy {
    /// Lane `k` of `n` reads the data lines whose index modulo `n` is `k`
    #[default]
    Partitioned,
    /// Every lane reads the whole input
    FullPass,
}

/// Applies header skipping and the read policy to an underlying cursor
struct Filtered<S> {
    inner: S,
    lines_to_skip: u64,
    policy: ReadPolicy,
    lane_index: u64,
    lanes: u64,
    data_index: u64,
}

impl<S> Filtered<S> {
    fn new(inner: S, lines_to_skip: u64, policy: ReadPolicy, lane: LaneId, lanes: usize) -> Self {
        Self {
            inner,
            lines_to_skip,
            policy,
            lane_index: lane.index() as u64,
            lanes: lanes.max(1) as u64,
            data_index: 0,
        }
    }

    fn accepts(&mut self, line: &SourceLine) -> bool {
        if line.number <= self.lines_to_skip {
            return false;
        }
        let index = self.data_index;
        self.data_index += 1;
        match self.policy {
            ReadPolicy::FullPass => true,
            ReadPolicy::Partitioned => index % self.lanes == self.lane_index,
        }
    }
}

#[async_trait]
impl<S> LineSource for Filtered<S>
where
    S: RawLines + Send,
{
    async fn next_line(&mut self) -> std::io::Result<Option<SourceLine>> {
        while let Some(line) = self.inner.next_raw().await? {
            if self.accepts(&line) {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }
}

/// Unfiltered, numbered line cursor
#[async_trait]
trait RawLines {
    async fn next_raw(&mut self) -> std::io::Result<Option<SourceLine>>;
}

struct FileLines {
    reader: BufReader<File>,
    buf: Vec<u8>,
    number: u64,
}

#[async_trait]
impl RawLines for FileLines {
    /// Bytes that are not UTF-8 are replaced with U+FFFD, so a bad line
    /// goes on to the decoder instead of failing the read
    async fn next_raw(&mut self) -> std::io::Result<Option<SourceLine>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        self.number += 1;

        let mut bytes = self.buf.as_slice();
        if let Some(rest) = bytes.strip_suffix(b"\n") {
            bytes = rest;
        }
        if let Some(rest) = bytes.strip_suffix(b"\r") {
            bytes = rest;
        }
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(e) => {
                warn!("Line {} is not valid UTF-8: {}", self.number, e);
                String::from_utf8_lossy(bytes).into_owned()
            }
        };
        Ok(Some(SourceLine {
            number: self.number,
            text,
        }))
    }
}

struct MemoryLines {
    lines: Arc<Vec<String>>,
    position: usize,
}

#[async_trait]
impl RawLines for MemoryLines {
    async fn next_raw(&mut self) -> std::io::Result<Option<SourceLine>> {
        let Some(text) = self.lines.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        Ok(Some(SourceLine {
            number: self.position as u64,
            text: text.clone(),
        }))
    }
}

/// Delimited text file on local disk
#[derive(Debug, Clone)]
pub struct FileSourceProvider {
    path: PathBuf,
    policy: ReadPolicy,
    lines_to_skip: u64,
}

impl FileSourceProvider {
    pub fn new(path: impl Into<PathBuf>, policy: ReadPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
            lines_to_skip: 0,
        }
    }

    /// Skip leading lines (e.g. a header row) before any lane sees data
    pub fn lines_to_skip(mut self, lines: u64) -> Self {
        self.lines_to_skip = lines;
        self
    }
}

#[async_trait]
impl SourceProvider for FileSourceProvider {
    async fn open(&self, lane: LaneId, lanes: usize) -> std::io::Result<Box<dyn LineSource>> {
        debug!("{} opening {} ({:?})", lane, self.path.display(), self.policy);
        let file = File::open(&self.path).await?;
        let raw = FileLines {
            reader: BufReader::new(file),
            buf: Vec::new(),
            number: 0,
        };
        Ok(Box::new(Filtered::new(
            raw,
            self.lines_to_skip,
            self.policy,
            lane,
            lanes,
        )))
    }
}

/// Lines held in memory, shared by all lanes
#[derive(Debug, Clone)]
pub struct MemorySourceProvider {
    lines: Arc<Vec<String>>,
    policy: ReadPolicy,
}

impl MemorySourceProvider {
    pub fn new<I, S>(lines: I, policy: ReadPolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: Arc::new(lines.into_iter().map(Into::into).collect()),
            policy,
        }
    }
}

#[async_trait]
impl SourceProvider for MemorySourceProvider {
    async fn open(&self, lane: LaneId, lanes: usize) -> std::io::Result<Box<dyn LineSource>> {
        let raw = MemoryLines {
            lines: self.lines.clone(),
            position: 0,
        };
        Ok(Box::new(Filtered::new(raw, 0, self.policy, lane, lanes)))
    }
}
