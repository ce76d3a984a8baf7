//! Replicated order coordinator
//!
//! - `ReplicatedLogManager`: LSN ordering, chain record insertion,
//!   checkpoint and head truncation decisions, primary-side replication
//! - `TruncationPolicy`: when to index, checkpoint, truncate and throttle
//! - `TransactionMap`: open and completed transaction chains
//! - `Replicator`/`ReplicationStream`: the replication transport seam

mod coordinator;
mod errors;
mod policy;
mod replicator;
mod role;
mod transactions;

pub use coordinator::ReplicatedLogManager;
pub use errors::{ReplicationError, ReplicationErrorKind, ReplicationResult};
pub use policy::{ThresholdTruncationPolicy, TruncationPolicy};
pub use replicator::{ReplicationOperation, ReplicationStream, Replicator};
pub use role::ReplicaRole;
pub use transactions::TransactionMap;
