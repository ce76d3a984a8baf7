//! Group-commit log writer
//!
//! - `insert` assigns the next PSN, the record's position and its physical
//!   back-link, serializes it and appends it to the in-memory buffer
//! - `flush` turns the buffer into a batch and starts (or joins) a group
//!   commit; at most one batch is physically in flight
//! - Records buffered and flushed while a batch is in flight wait in the
//!   pending list and become the next batch when the in-flight one completes
//! - One batch is exactly one append plus one flush on the stream
//!
//! Batches run on a single spawned task that loops until nothing is pending,
//! so write order within a batch equals insertion order and batch N+1 never
//! starts before batch N completes. The state mutex guards batch transitions
//! only; it is never held across I/O.
//!
//! A failed batch fails every record in it and every record buffered behind
//! it, and latches the writer closed: all later inserts fail immediately.

use std::mem;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, error, info};

use super::sink::BatchSink;
use super::waiters::FlushWaiters;
use super::FlushedBatch;
use crate::errors::{LogError, LogResult};
use crate::observability::LogMetrics;
use crate::record::{encode_frame, LogRecord, PhysicalLink, Psn, RecordArena};
use crate::storage::LogStream;
use crate::sync::lock;

/// Where the next inserted record lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterPosition {
    pub next_psn: Psn,
    pub next_position: u64,
    /// PSN and position of the last physical record, if any
    pub last_physical: Option<(Psn, u64)>,
}

impl WriterPosition {
    /// Position of an empty log starting at `next_position`
    pub fn empty(next_position: u64) -> Self {
        Self {
            next_psn: 1,
            next_position,
            last_physical: None,
        }
    }

    /// Position just past `tail`, given the last physical record at or before it
    pub fn after(tail: &LogRecord, last_physical: Option<&LogRecord>) -> Self {
        Self {
            next_psn: tail.psn() + 1,
            next_position: tail.end_position().unwrap_or(0),
            last_physical: last_physical.and_then(|r| Some((r.psn(), r.position()?))),
        }
    }
}

struct BufferedRecord {
    record: Arc<LogRecord>,
    bytes: Vec<u8>,
}

enum ExitState {
    Running,
    Requested(Vec<oneshot::Sender<()>>),
    Frozen,
}

struct WriterState {
    position: WriterPosition,
    /// Inserted, no flush requested yet
    buffered: Vec<BufferedRecord>,
    buffered_bytes: u64,
    /// Flush requested while a batch was in flight
    pending: Vec<BufferedRecord>,
    /// Bytes not yet durable: buffered, pending and in flight
    unflushed_bytes: u64,
    in_flight_last: Option<Arc<LogRecord>>,
    flush_in_flight: bool,
    fault: Option<LogError>,
    exit: ExitState,
}

/// Buffers records and writes them to the stream in group commits
pub struct PhysicalLogWriter {
    stream: Arc<dyn LogStream>,
    arena: Arc<RecordArena>,
    waiters: Arc<FlushWaiters>,
    metrics: Arc<LogMetrics>,
    sink: BatchSink,
    max_pending_flush_bytes: u64,
    state: Mutex<WriterState>,
}

impl PhysicalLogWriter {
    pub fn new(
        stream: Arc<dyn LogStream>,
        arena: Arc<RecordArena>,
        waiters: Arc<FlushWaiters>,
        metrics: Arc<LogMetrics>,
        sink: BatchSink,
        max_pending_flush_bytes: u64,
        position: WriterPosition,
    ) -> Arc<Self> {
        Arc::new(Self {
            stream,
            arena,
            waiters,
            metrics,
            sink,
            max_pending_flush_bytes,
            state: Mutex::new(WriterState {
                position,
                buffered: Vec::new(),
                buffered_bytes: 0,
                pending: Vec::new(),
                unflushed_bytes: 0,
                in_flight_last: None,
                flush_in_flight: false,
                fault: None,
                exit: ExitState::Running,
            }),
        })
    }

    /// Buffer `record` and return the total buffered bytes.
    ///
    /// Fails with `LogError::Closed` once the writer is faulted or frozen.
    pub fn insert(&self, record: Arc<LogRecord>) -> LogResult<u64> {
        let mut state = lock(&self.state);
        if state.fault.is_some() || !matches!(state.exit, ExitState::Running) {
            return Err(LogError::Closed);
        }

        let position = state.position;
        record.set_psn(position.next_psn);
        let (link, delta) = match position.last_physical {
            Some((psn, at)) => (PhysicalLink::Psn(psn), position.next_position - at),
            None => (PhysicalLink::None, 0),
        };
        record.set_previous_physical(link);

        let bytes = encode_frame(&record, delta);
        let length = bytes.len() as u32;
        record.set_placement(position.next_position, length);

        if record.record_type().is_physical() {
            state.position.last_physical = Some((position.next_psn, position.next_position));
        }
        state.position.next_psn += 1;
        state.position.next_position += u64::from(length);
        state.buffered_bytes += u64::from(length);
        state.unflushed_bytes += u64::from(length);

        self.arena.insert(Arc::clone(&record));
        state.buffered.push(BufferedRecord { record, bytes });
        Ok(state.buffered_bytes)
    }

    /// Start a group commit of everything buffered, without waiting.
    ///
    /// Returns the record whose flush completes the request, or `None` when
    /// nothing is buffered or in flight. Must run inside a tokio runtime.
    pub fn start_flush(self: &Arc<Self>, initiator: &'static str) -> Option<Arc<LogRecord>> {
        let mut state = lock(&self.state);
        if state.buffered.is_empty() {
            return state
                .pending
                .last()
                .map(|b| Arc::clone(&b.record))
                .or_else(|| state.in_flight_last.clone());
        }

        let batch = mem::take(&mut state.buffered);
        state.buffered_bytes = 0;
        let target = batch.last().map(|b| Arc::clone(&b.record));

        if state.flush_in_flight {
            debug!(initiator, records = batch.len(), "flush joined pending batch");
            state.pending.extend(batch);
        } else {
            state.flush_in_flight = true;
            state.in_flight_last = target.clone();
            debug!(initiator, records = batch.len(), "flush started");
            tokio::spawn(Arc::clone(self).run_flush_loop(batch));
        }
        target
    }

    /// Flush everything buffered and wait until it is durable.
    ///
    /// A no-op that resolves immediately when nothing is buffered or in flight.
    pub async fn flush(self: &Arc<Self>, initiator: &'static str) -> LogResult<()> {
        if let Some(fault) = self.fault() {
            return Err(fault);
        }
        match self.start_flush(initiator) {
            Some(record) => record.flushed().wait().await,
            None => Ok(()),
        }
    }

    async fn write_batch(&self, batch: &[BufferedRecord]) -> LogResult<()> {
        let total: usize = batch.iter().map(|b| b.bytes.len()).sum();
        let mut bytes = Vec::with_capacity(total);
        for buffered in batch {
            bytes.extend_from_slice(&buffered.bytes);
        }
        self.stream.append(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn run_flush_loop(self: Arc<Self>, mut batch: Vec<BufferedRecord>) {
        loop {
            let outcome = self.write_batch(&batch).await;
            let bytes: u64 = batch.iter().map(|b| b.bytes.len() as u64).sum();
            let records: Vec<_> = batch.into_iter().map(|b| b.record).collect();

            let first_psn = records.first().map(|r| r.psn());
            let last_psn = records.last().map(|r| r.psn());
            match &outcome {
                Ok(()) => {
                    self.metrics.record_flush_batch(records.len() as u64, bytes);
                    debug!(records = records.len(), bytes, ?first_psn, ?last_psn, "flush batch completed");
                }
                Err(e) => {
                    self.metrics.increment_failed_batches();
                    error!(records = records.len(), ?first_psn, ?last_psn, error = %e, "flush batch failed");
                }
            }

            let (next, abandoned, exit_waiters) = {
                let mut state = lock(&self.state);
                state.unflushed_bytes -= bytes;

                let mut abandoned = Vec::new();
                if let Err(e) = &outcome {
                    state.fault.get_or_insert_with(|| e.clone());
                    abandoned.append(&mut state.pending);
                    abandoned.append(&mut state.buffered);
                    state.buffered_bytes = 0;
                    state.unflushed_bytes = 0;
                }

                if !state.pending.is_empty() {
                    let next = mem::take(&mut state.pending);
                    state.in_flight_last = next.last().map(|b| Arc::clone(&b.record));
                    (Some(next), abandoned, Vec::new())
                } else {
                    state.flush_in_flight = false;
                    state.in_flight_last = None;
                    let exit_waiters = match mem::replace(&mut state.exit, ExitState::Running) {
                        ExitState::Requested(waiters) => {
                            state.exit = ExitState::Frozen;
                            abandoned.append(&mut state.buffered);
                            state.buffered_bytes = 0;
                            waiters
                        }
                        other => {
                            state.exit = other;
                            Vec::new()
                        }
                    };
                    (None, abandoned, exit_waiters)
                }
            };

            let max_lsn = records.iter().map(|r| r.lsn()).max();
            // Counted as outstanding before anyone observes the flush
            self.sink.send(FlushedBatch {
                records: records.clone(),
                outcome: outcome.clone(),
            });
            for record in &records {
                record.flushed().resolve(outcome.clone());
            }
            match &outcome {
                Ok(()) => {
                    if let Some(lsn) = max_lsn {
                        self.waiters.notify_flushed(lsn);
                    }
                }
                Err(e) => self.waiters.fail_all(e.clone()),
            }

            if !abandoned.is_empty() {
                let error = outcome.clone().err().unwrap_or(LogError::Closed);
                self.fail_records(abandoned, error);
            }
            for waiter in exit_waiters {
                let _ = waiter.send(());
            }

            match next {
                Some(next) => batch = next,
                None => break,
            }
        }
    }

    fn fail_records(&self, abandoned: Vec<BufferedRecord>, error: LogError) {
        let records: Vec<_> = abandoned.into_iter().map(|b| b.record).collect();
        self.sink.send(FlushedBatch {
            records: records.clone(),
            outcome: Err(error.clone()),
        });
        for record in &records {
            record.flushed().resolve(Err(error.clone()));
        }
    }

    /// Freeze the writer at the next batch boundary.
    ///
    /// Records still buffered when the writer freezes fail with
    /// `LogError::Closed`; flush first to keep them.
    pub async fn prepare_to_close(&self) {
        let receiver = {
            let mut state = lock(&self.state);
            let (sender, receiver) = oneshot::channel();
            match mem::replace(&mut state.exit, ExitState::Frozen) {
                ExitState::Frozen => return,
                ExitState::Requested(mut waiters) => {
                    waiters.push(sender);
                    state.exit = ExitState::Requested(waiters);
                    receiver
                }
                ExitState::Running if state.flush_in_flight => {
                    state.exit = ExitState::Requested(vec![sender]);
                    receiver
                }
                ExitState::Running => {
                    let abandoned = mem::take(&mut state.buffered);
                    state.buffered_bytes = 0;
                    drop(state);
                    if !abandoned.is_empty() {
                        self.fail_records(abandoned, LogError::Closed);
                    }
                    info!("log writer frozen");
                    return;
                }
            }
        };
        let _ = receiver.await;
        info!("log writer frozen");
    }

    /// Whether unflushed bytes exceed the backpressure ceiling
    pub fn should_throttle(&self) -> bool {
        lock(&self.state).unflushed_bytes > self.max_pending_flush_bytes
    }

    pub fn buffered_bytes(&self) -> u64 {
        lock(&self.state).buffered_bytes
    }

    pub fn unflushed_bytes(&self) -> u64 {
        lock(&self.state).unflushed_bytes
    }

    /// The failure that closed the writer, if any
    pub fn fault(&self) -> Option<LogError> {
        lock(&self.state).fault.clone()
    }

    pub fn is_closed(&self) -> bool {
        let state = lock(&self.state);
        state.fault.is_some() || !matches!(state.exit, ExitState::Running)
    }

    pub fn position(&self) -> WriterPosition {
        lock(&self.state).position
    }

    /// Offset the next record will be written at
    pub fn tail_position(&self) -> u64 {
        lock(&self.state).position.next_position
    }

    /// Rewind after the stream tail was truncated.
    ///
    /// The writer must be idle.
    pub fn reset_after_tail_truncation(&self, position: WriterPosition) {
        let mut state = lock(&self.state);
        assert!(
            state.buffered.is_empty() && state.pending.is_empty() && !state.flush_in_flight,
            "tail truncation with records in the commit pipeline"
        );
        state.position = position;
    }

    pub fn stream(&self) -> &Arc<dyn LogStream> {
        &self.stream
    }
}
