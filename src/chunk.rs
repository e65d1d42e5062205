//! Fixed-size batching of decoded records

use crate::models::VehicleRecord;

/// Default number of records per bulk write
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// A batch of records handed to the sink as a unit
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Position of this chunk within its lane, starting from 0
    pub seq: usize,
    pub records: Vec<VehicleRecord>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Accumulates records until `capacity` is reached
#[derive(Debug)]
pub struct ChunkBuffer {
    capacity: usize,
    records: Vec<VehicleRecord>,
    next_seq: usize,
}

impl ChunkBuffer {
    /// Create a buffer; a capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Vec::with_capacity(capacity),
            next_seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of records waiting for the next flush
    pub fn pending(&self) -> usize {
        self.records.len()
    }

    /// Append a record, returning the full chunk once capacity is reached.
    pub fn push(&mut self, record: VehicleRecord) -> Option<Chunk> {
        self.records.push(record);
        if self.records.len() >= self.capacity {
            Some(self.take())
        } else {
            None
        }
    }

    /// Drain the final partial chunk at end of input.
    pub fn finish(&mut self) -> Option<Chunk> {
        if self.records.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> Chunk {
        let records = std::mem::replace(&mut self.records, Vec::with_capacity(self.capacity));
        let seq = self.next_seq;
        self.next_seq += 1;
        Chunk { seq, records }
    }
}
