//! Log lifecycle manager
//!
//! Owns the active log stream and the commit pipeline bound to it.
//!
//! Aliases:
//! - `current`: the live log
//! - `copy`: a log being built for a secondary under full copy
//! - `backup`: the previous live log, kept until the next copy completes
//!
//! Alias changes are ordered so that a crash at any step leaves a log that
//! `open_or_create` can recover: a missing `current` is restored from
//! `copy` first, then from `backup`.
//!
//! Head truncation is gated by registered readers. A truncation that would
//! cut into a reader's range is parked as the single pending request and
//! fires when the last blocking reader is removed.

use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tracing::{info, warn};

use super::readers::{LogReaderRange, LogReaderRanges, LogReaderType};
use super::recovery::{LogRecordsReader, RecoveryInformation, ScannedFrame};
use crate::errors::{LogError, LogResult};
use crate::observability::{LogMetrics, PhaseScope};
use crate::pipeline::{BatchSink, FlushWaiters, PhysicalLogWriter, WriterPosition};
use crate::record::{
    BeginCheckpointBody, CheckpointState, EndCheckpointBody, Epoch, LogRecord, LogRecordType,
    Lsn, PhysicalLink, RecordArena, RecordBody, RecordError, TruncationState, INVALID_PSN,
    ZERO_LSN,
};
use crate::storage::{LogStore, LogStream};
use crate::sync::{lock, read, write};

pub const CURRENT_ALIAS: &str = "current";
pub const COPY_ALIAS: &str = "copy";
pub const BACKUP_ALIAS: &str = "backup";

struct ActiveLog {
    alias: &'static str,
    writer: Arc<PhysicalLogWriter>,
}

struct PendingHeadTruncation {
    record: Arc<LogRecord>,
    position: u64,
}

#[derive(Default)]
struct ReaderState {
    ranges: LogReaderRanges,
    pending_truncation: Option<PendingHeadTruncation>,
    /// Target of the head truncation being applied. Readers may not pin
    /// anything below it even though the stream head has not moved yet.
    truncating_to: Option<u64>,
}

impl ReaderState {
    fn begin_truncation(&mut self, position: u64) {
        self.truncating_to = Some(self.truncating_to.map_or(position, |t| t.max(position)));
    }
}

/// What `process_head_truncation` did with the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadTruncationOutcome {
    Applied,
    /// Parked until the blocking readers are removed
    Deferred,
}

/// Result of opening the log
#[derive(Debug)]
pub struct OpenedLog {
    pub info: RecoveryInformation,
    /// Whether existing records were recovered, as opposed to a fresh log
    pub recovered: bool,
    /// The live log was missing and the backup alias took its place
    pub restored_from_backup: bool,
}

pub struct LogManager {
    store: Arc<dyn LogStore>,
    arena: Arc<RecordArena>,
    waiters: Arc<FlushWaiters>,
    metrics: Arc<LogMetrics>,
    sink: BatchSink,
    max_pending_flush_bytes: u64,
    active: RwLock<Option<ActiveLog>>,
    readers: Mutex<ReaderState>,
}

impl LogManager {
    pub fn new(
        store: Arc<dyn LogStore>,
        metrics: Arc<LogMetrics>,
        sink: BatchSink,
        max_pending_flush_bytes: u64,
    ) -> Self {
        Self {
            store,
            arena: Arc::new(RecordArena::new()),
            waiters: Arc::new(FlushWaiters::new(0)),
            metrics,
            sink,
            max_pending_flush_bytes,
            active: RwLock::new(None),
            readers: Mutex::new(ReaderState::default()),
        }
    }

    /// Open the live log, recovering its records, or create a fresh one
    pub async fn open_or_create(&self) -> LogResult<OpenedLog> {
        let restored_from = self.recover_aliases().await?;
        let restored_from_backup = restored_from == Some(BACKUP_ALIAS);

        let stream = if self.store.exists(CURRENT_ALIAS).await? {
            let stream = self.store.open(CURRENT_ALIAS).await?;
            if let Some(info) = self.recover(CURRENT_ALIAS, Arc::clone(&stream)).await? {
                return Ok(OpenedLog {
                    info,
                    recovered: true,
                    restored_from_backup,
                });
            }
            stream
        } else {
            self.store.create(CURRENT_ALIAS).await?
        };

        let info = self
            .bootstrap(CURRENT_ALIAS, stream, Epoch::ZERO, ZERO_LSN)
            .await?;
        Ok(OpenedLog {
            info,
            recovered: false,
            restored_from_backup: false,
        })
    }

    /// Put a copy or backup log in place of a missing live log.
    /// Returns the alias that was restored.
    async fn recover_aliases(&self) -> LogResult<Option<&'static str>> {
        if self.store.exists(CURRENT_ALIAS).await? {
            return Ok(None);
        }
        for alias in [COPY_ALIAS, BACKUP_ALIAS] {
            if self.store.exists(alias).await? {
                warn!(from = alias, to = CURRENT_ALIAS, "restoring live log from alias");
                self.store.rename(alias, CURRENT_ALIAS).await?;
                return Ok(Some(alias));
            }
        }
        Ok(None)
    }

    /// Rebuild the arena from the stream. `None` if the stream holds no records.
    async fn recover(
        &self,
        alias: &'static str,
        stream: Arc<dyn LogStream>,
    ) -> LogResult<Option<RecoveryInformation>> {
        let head = stream.head_position();
        let bytes = stream.read_from(head).await?;
        let scanned = LogRecordsReader::new(&bytes, head).read_all()?;

        if scanned.torn_tail {
            warn!(
                alias,
                valid_end = scanned.valid_end,
                write_position = stream.write_position(),
                "truncating torn record at log tail"
            );
            stream.truncate_tail(scanned.valid_end).await?;
        }
        if scanned.frames.is_empty() {
            return Ok(None);
        }

        self.arena.clear();
        let record_count = scanned.frames.len();
        for ScannedFrame { position, frame } in scanned.frames {
            if let Some(last) = self.arena.last() {
                if frame.psn <= last.psn() {
                    return Err(RecordError::malformed(format!(
                        "psn {} at position {} follows psn {}",
                        frame.psn,
                        position,
                        last.psn()
                    ))
                    .into());
                }
            }
            let link = if frame.previous_physical_delta == 0 {
                PhysicalLink::None
            } else {
                let previous = position
                    .checked_sub(frame.previous_physical_delta)
                    .ok_or_else(|| {
                        RecordError::malformed(format!(
                            "physical delta {} at position {} points before the log",
                            frame.previous_physical_delta, position
                        ))
                    })?;
                // the predecessor may sit below the truncated head
                self.arena
                    .at_position(previous)
                    .map_or(PhysicalLink::None, |r| PhysicalLink::Psn(r.psn()))
            };
            self.arena.insert(LogRecord::recovered(
                frame.lsn,
                frame.psn,
                position,
                frame.length,
                link,
                frame.body,
            ));
        }

        let info = RecoveryInformation::from_arena(&self.arena)?;

        let head_position = info.current_head.position().unwrap_or(head);
        if head_position > stream.head_position() {
            info!(alias, head_position, "reapplying head truncation");
            stream.truncate_head(head_position).await?;
            self.arena.prune_before_position(head_position);
        }
        for record in self.arena.records() {
            if record.record_type() == LogRecordType::TruncateHead {
                record.set_truncation_state(TruncationState::Completed);
            }
        }

        let writer = self.new_writer(
            stream,
            WriterPosition::after(&info.tail, info.last_physical.as_deref()),
        );
        *write(&self.active) = Some(ActiveLog { alias, writer });
        self.set_flushed_lsn(info.tail_lsn);

        info!(
            alias,
            records = record_count,
            tail_lsn = info.tail_lsn,
            head_position,
            "log recovered"
        );
        Ok(Some(info))
    }

    /// Seed an empty stream with an Indexing record and a completed checkpoint
    async fn bootstrap(
        &self,
        alias: &'static str,
        stream: Arc<dyn LogStream>,
        epoch: Epoch,
        lsn: Lsn,
    ) -> LogResult<RecoveryInformation> {
        self.arena.clear();
        let start = stream.write_position();
        let writer = self.new_writer(stream, WriterPosition::empty(start));

        let index = LogRecord::new(
            lsn,
            RecordBody::Indexing {
                current_epoch: epoch,
                linked_physical_psn: INVALID_PSN,
            },
        );
        writer.insert(Arc::clone(&index))?;
        let head = index.log_head();

        let begin = LogRecord::new(
            lsn,
            RecordBody::BeginCheckpoint(BeginCheckpointBody {
                earliest_pending_transaction_lsn: lsn,
                earliest_pending_transaction_psn: head.psn,
                earliest_pending_transaction_position: head.position,
                epoch,
                is_first_checkpoint_on_full_copy: false,
                periodic_checkpoint_time_ms: Utc::now().timestamp_millis(),
                linked_physical_psn: head.psn,
            }),
        );
        begin.set_checkpoint_state(CheckpointState::Completed);
        writer.insert(Arc::clone(&begin))?;

        let end = LogRecord::new(
            lsn,
            RecordBody::EndCheckpoint(EndCheckpointBody {
                log_head: head,
                last_stable_lsn: lsn,
                last_completed_begin_checkpoint_psn: begin.psn(),
                linked_physical_psn: begin.psn(),
            }),
        );
        writer.insert(Arc::clone(&end))?;

        writer.insert(LogRecord::new(
            lsn,
            RecordBody::CompleteCheckpoint {
                log_head: head,
                linked_physical_psn: end.psn(),
            },
        ))?;

        *write(&self.active) = Some(ActiveLog {
            alias,
            writer: Arc::clone(&writer),
        });
        writer.flush("bootstrap").await?;
        self.set_flushed_lsn(lsn);

        info!(alias, lsn, %epoch, "log created");
        Ok(RecoveryInformation::from_arena(&self.arena)?)
    }

    fn new_writer(
        &self,
        stream: Arc<dyn LogStream>,
        position: WriterPosition,
    ) -> Arc<PhysicalLogWriter> {
        PhysicalLogWriter::new(
            stream,
            Arc::clone(&self.arena),
            Arc::clone(&self.waiters),
            Arc::clone(&self.metrics),
            self.sink.clone(),
            self.max_pending_flush_bytes,
            position,
        )
    }

    fn set_flushed_lsn(&self, lsn: Lsn) {
        self.waiters.reset(lsn);
        self.waiters.notify_flushed(lsn);
    }

    /// Freeze the live log and start a fresh one under the copy alias.
    ///
    /// The caller drains record processing first.
    pub async fn create_copy_log(
        &self,
        starting_epoch: Epoch,
        starting_lsn: Lsn,
    ) -> LogResult<RecoveryInformation> {
        let old = self.writer()?;
        old.flush("create_copy_log").await?;
        old.prepare_to_close().await;
        self.abort_pending_head_truncation();

        self.store.delete(COPY_ALIAS).await?;
        let stream = self.store.create(COPY_ALIAS).await?;
        self.bootstrap(COPY_ALIAS, stream, starting_epoch, starting_lsn)
            .await
    }

    /// Promote the copy log to the live log.
    ///
    /// Deletes the stale backup, renames current to backup, then copy to
    /// current.
    pub async fn rename_copy_log_atomically(&self) -> LogResult<()> {
        let writer = {
            let active = read(&self.active);
            match active.as_ref() {
                Some(log) if log.alias == COPY_ALIAS => Arc::clone(&log.writer),
                Some(log) => {
                    return Err(LogError::InvalidOperation(format!(
                        "active log is '{}', not the copy log",
                        log.alias
                    )))
                }
                None => return Err(LogError::Closed),
            }
        };
        writer.flush("rename_copy_log").await?;
        writer.prepare_to_close().await;
        let position = writer.position();

        self.store.delete(BACKUP_ALIAS).await?;
        if self.store.exists(CURRENT_ALIAS).await? {
            self.store.rename(CURRENT_ALIAS, BACKUP_ALIAS).await?;
        }
        self.store.rename(COPY_ALIAS, CURRENT_ALIAS).await?;

        let stream = self.store.open(CURRENT_ALIAS).await?;
        let writer = self.new_writer(stream, position);
        *write(&self.active) = Some(ActiveLog {
            alias: CURRENT_ALIAS,
            writer,
        });
        info!("copy log renamed to live log");
        Ok(())
    }

    /// Delete every alias: backup, then copy, then current
    pub async fn delete_log(&self) -> LogResult<()> {
        let active = write(&self.active).take();
        if let Some(active) = active {
            active.writer.prepare_to_close().await;
        }
        for alias in [BACKUP_ALIAS, COPY_ALIAS, CURRENT_ALIAS] {
            self.store.delete(alias).await?;
        }
        self.arena.clear();
        info!("log deleted");
        Ok(())
    }

    /// Pin the log from `position` for a reader
    pub fn add_reader(&self, position: u64, reader_type: LogReaderType) -> LogResult<()> {
        let mut readers = lock(&self.readers);
        let head = self.head_position()?;
        let floor = readers.truncating_to.map_or(head, |target| target.max(head));
        if position < floor {
            return Err(LogError::InvalidOperation(format!(
                "reader position {} is below the log head {}",
                position, floor
            )));
        }
        readers.ranges.add(position, reader_type);
        Ok(())
    }

    /// Release a reader. Fires the pending head truncation once no reader
    /// blocks it.
    pub async fn remove_reader(&self, position: u64, reader_type: LogReaderType) -> LogResult<()> {
        let released = {
            let mut readers = lock(&self.readers);
            readers.ranges.remove(position, reader_type);
            let unblocked = readers
                .pending_truncation
                .as_ref()
                .map_or(false, |p| readers.ranges.permits_head_truncation(p.position));
            if unblocked {
                let pending = readers.pending_truncation.take();
                if let Some(pending) = &pending {
                    readers.begin_truncation(pending.position);
                }
                pending
            } else {
                None
            }
        };
        if let Some(pending) = released {
            info!(
                phase = "Apply",
                lsn = pending.record.lsn(),
                position = pending.position,
                "deferred head truncation released"
            );
            self.apply_head_truncation(&pending.record, pending.position)
                .await?;
        }
        Ok(())
    }

    pub fn earliest_reader(&self) -> Option<LogReaderRange> {
        lock(&self.readers).ranges.earliest()
    }

    /// Truncate the head at the position recorded in a TruncateHead record,
    /// or defer it while a reader needs the data
    pub async fn process_head_truncation(
        &self,
        record: &Arc<LogRecord>,
    ) -> LogResult<HeadTruncationOutcome> {
        let position = match record.body() {
            RecordBody::TruncateHead { log_head, .. } => log_head.position,
            _ => panic!("{} is not a head truncation record", record),
        };
        info!(phase = "Initialize", lsn = record.lsn(), position, "head truncation");

        let deferred_behind = {
            let mut readers = lock(&self.readers);
            if readers.ranges.permits_head_truncation(position) {
                readers.begin_truncation(position);
                None
            } else {
                if let Some(pending) = &readers.pending_truncation {
                    panic!(
                        "head truncation {} requested while {} is pending",
                        record, pending.record
                    );
                }
                readers.pending_truncation = Some(PendingHeadTruncation {
                    record: Arc::clone(record),
                    position,
                });
                readers.ranges.earliest()
            }
        };

        if let Some(reader) = deferred_behind {
            info!(
                phase = "Deferred",
                lsn = record.lsn(),
                position,
                reader_position = reader.starting_position,
                reader_type = ?reader.reader_type,
                "head truncation deferred behind reader"
            );
            return Ok(HeadTruncationOutcome::Deferred);
        }
        self.apply_head_truncation(record, position).await?;
        Ok(HeadTruncationOutcome::Applied)
    }

    async fn apply_head_truncation(&self, record: &Arc<LogRecord>, position: u64) -> LogResult<()> {
        let scope = PhaseScope::new("TRUNCATE_HEAD", record.lsn());
        record.set_truncation_state(TruncationState::Applied);

        let truncated = match self.writer() {
            Ok(writer) => writer.stream().truncate_head(position).await.map_err(LogError::from),
            Err(e) => Err(e),
        };
        lock(&self.readers).truncating_to = None;
        if let Err(e) = truncated {
            record.set_truncation_state(TruncationState::Faulted);
            scope.fail(&e);
            return Err(e);
        }
        let pruned = self.arena.prune_before_position(position);
        record.set_truncation_state(TruncationState::Completed);
        self.metrics.increment_head_truncations();

        info!(phase = "Completed", lsn = record.lsn(), position, pruned, "head truncated");
        scope.complete();
        Ok(())
    }

    /// Drop the pending head truncation, if any
    pub fn abort_pending_head_truncation(&self) -> Option<Arc<LogRecord>> {
        let pending = lock(&self.readers).pending_truncation.take()?;
        pending.record.set_truncation_state(TruncationState::Aborted);
        info!(lsn = pending.record.lsn(), position = pending.position, "pending head truncation aborted");
        Some(pending.record)
    }

    pub fn pending_head_truncation(&self) -> Option<Arc<LogRecord>> {
        lock(&self.readers)
            .pending_truncation
            .as_ref()
            .map(|p| Arc::clone(&p.record))
    }

    /// Cut the stream just past `new_tail` and rewind the writer.
    ///
    /// The arena must already be trimmed to `new_tail`.
    pub async fn truncate_tail(
        &self,
        new_tail: &LogRecord,
        last_physical: Option<&LogRecord>,
    ) -> LogResult<()> {
        let writer = self.writer()?;
        let end = new_tail.end_position().ok_or_else(|| {
            LogError::InvalidOperation(format!("{} has no position", new_tail))
        })?;
        writer.stream().truncate_tail(end).await?;
        writer.reset_after_tail_truncation(WriterPosition::after(new_tail, last_physical));
        self.waiters.reset(new_tail.lsn());
        Ok(())
    }

    /// Freeze the active writer at its next batch boundary
    pub async fn close(&self) {
        let writer = read(&self.active).as_ref().map(|log| Arc::clone(&log.writer));
        if let Some(writer) = writer {
            writer.prepare_to_close().await;
        }
    }

    /// Writer of the active log
    pub fn writer(&self) -> LogResult<Arc<PhysicalLogWriter>> {
        read(&self.active)
            .as_ref()
            .map(|log| Arc::clone(&log.writer))
            .ok_or(LogError::Closed)
    }

    pub fn active_alias(&self) -> Option<&'static str> {
        read(&self.active).as_ref().map(|log| log.alias)
    }

    pub fn head_position(&self) -> LogResult<u64> {
        Ok(self.writer()?.stream().head_position())
    }

    pub fn tail_position(&self) -> LogResult<u64> {
        Ok(self.writer()?.tail_position())
    }

    pub fn arena(&self) -> &Arc<RecordArena> {
        &self.arena
    }

    pub fn waiters(&self) -> &Arc<FlushWaiters> {
        &self.waiters
    }

    pub fn sink(&self) -> &BatchSink {
        &self.sink
    }
}
