//! Replication transport interfaces

use async_trait::async_trait;

use super::errors::ReplicationResult;
use crate::record::Lsn;

/// Primary-side transport: sends a serialized logical record to the
/// secondaries and returns the LSN assigned to it
#[async_trait]
pub trait Replicator: Send + Sync {
    async fn replicate(&self, bytes: Vec<u8>) -> ReplicationResult<Lsn>;
}

/// A logical record received from the primary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationOperation {
    /// LSN the primary assigned
    pub lsn: Lsn,
    /// Logical encoding of the record
    pub data: Vec<u8>,
}

impl ReplicationOperation {
    pub fn new(lsn: Lsn, data: Vec<u8>) -> Self {
        Self { lsn, data }
    }
}

/// Secondary-side stream of logical records from the primary, in LSN order
#[async_trait]
pub trait ReplicationStream: Send {
    /// Next record, or `None` when the stream ends
    async fn next(&mut self) -> ReplicationResult<Option<ReplicationOperation>>;

    /// Acknowledge that the record at `lsn` is durable locally
    fn acknowledge(&mut self, lsn: Lsn);
}
