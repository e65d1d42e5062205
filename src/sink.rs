//! Bulk persistence target

use async_trait::async_trait;

use crate::chunk::Chunk;
use crate::errors::WriteError;
use crate::models::RecordId;

/// Receives chunks from every lane concurrently.
///
/// Each call is atomic on its own: either every record of the chunk is
/// stored and one identifier per record is returned, in chunk order, or
/// nothing is stored.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write_batch(&self, chunk: Chunk) -> Result<Vec<RecordId>, WriteError>;
}
