//! State provider interface
//!
//! The application state the log drives. Redo and undo payloads are opaque
//! to the log and interpreted only here.

use async_trait::async_trait;

use crate::errors::LogResult;
use crate::record::{Lsn, OperationContext, TransactionId};

/// Why an operation is being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyContext {
    /// Redo on the primary after replication
    PrimaryRedo,
    /// Redo on a secondary after receipt from the primary
    SecondaryRedo,
    /// Redo of a record replayed while opening the log
    RecoveryRedo,
    /// Undo of an operation rolled back by its transaction
    Undo,
    /// Undo of an operation removed by tail truncation
    FalseProgress,
}

impl ApplyContext {
    pub fn is_redo(self) -> bool {
        matches!(
            self,
            ApplyContext::PrimaryRedo | ApplyContext::SecondaryRedo | ApplyContext::RecoveryRedo
        )
    }
}

#[async_trait]
pub trait StateProvider: Send + Sync {
    /// Apply one redo or undo payload.
    ///
    /// Returns the context of any lock the operation holds; the log passes
    /// it back to `unlock` once the operation's transaction completes.
    async fn apply(
        &self,
        lsn: Lsn,
        transaction_id: TransactionId,
        metadata: &[u8],
        data: &[u8],
        context: ApplyContext,
    ) -> LogResult<Option<OperationContext>>;

    /// Release what `apply` locked
    fn unlock(&self, context: OperationContext);

    async fn prepare_checkpoint(&self, lsn: Lsn) -> LogResult<()>;

    async fn perform_checkpoint(&self) -> LogResult<()>;

    async fn complete_checkpoint(&self) -> LogResult<()>;
}
