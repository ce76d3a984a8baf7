use crate::ordering::ReplicaRole;
use crate::record::LogRecordType;

/// How the processor handles a flushed record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Applied to the state provider in LSN order; locks held until the
    /// transaction completes
    Normal,
    /// Acted on by the log itself as soon as it is processed
    ApplyImmediately,
    /// Only marked processed
    ProcessImmediately,
}

/// Classify a record by its type and the current replica role.
///
/// Barrier, TruncateHead and BeginCheckpoint records are only acted on once
/// a role is established; while the role is unknown (recovery) they were
/// already accounted for by the recovery scan.
pub fn classify(record_type: LogRecordType, role: ReplicaRole) -> ProcessingMode {
    match record_type {
        LogRecordType::BeginTransaction
        | LogRecordType::Operation
        | LogRecordType::EndTransaction => ProcessingMode::Normal,
        LogRecordType::Barrier | LogRecordType::TruncateHead | LogRecordType::BeginCheckpoint => {
            if role == ReplicaRole::Unknown {
                ProcessingMode::ProcessImmediately
            } else {
                ProcessingMode::ApplyImmediately
            }
        }
        _ => ProcessingMode::ProcessImmediately,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transactional_records_are_normal() {
        for role in [ReplicaRole::Unknown, ReplicaRole::Primary, ReplicaRole::IdleSecondary] {
            assert_eq!(
                classify(LogRecordType::Operation, role),
                ProcessingMode::Normal
            );
            assert_eq!(
                classify(LogRecordType::EndTransaction, role),
                ProcessingMode::Normal
            );
        }
    }

    #[test]
    fn test_chain_records_wait_for_role() {
        assert_eq!(
            classify(LogRecordType::Barrier, ReplicaRole::Unknown),
            ProcessingMode::ProcessImmediately
        );
        assert_eq!(
            classify(LogRecordType::Barrier, ReplicaRole::ActiveSecondary),
            ProcessingMode::ApplyImmediately
        );
        assert_eq!(
            classify(LogRecordType::BeginCheckpoint, ReplicaRole::Primary),
            ProcessingMode::ApplyImmediately
        );
    }

    #[test]
    fn test_other_records_process_immediately() {
        for record_type in [
            LogRecordType::Indexing,
            LogRecordType::UpdateEpoch,
            LogRecordType::EndCheckpoint,
            LogRecordType::CompleteCheckpoint,
            LogRecordType::Information,
        ] {
            assert_eq!(
                classify(record_type, ReplicaRole::Primary),
                ProcessingMode::ProcessImmediately
            );
        }
    }
}
