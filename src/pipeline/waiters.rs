//! Waiters for "flushed up to LSN"
//!
//! Waiters are kept sorted by LSN. When a batch completes, every waiter at or
//! below the highest LSN of the batch is woken with the batch outcome. A
//! failed batch fails every waiter; the log is faulted from then on.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::errors::{LogError, LogResult};
use crate::record::Lsn;
use crate::sync::lock;

struct WaitersState {
    flushed_lsn: Lsn,
    fault: Option<LogError>,
    waiters: BTreeMap<Lsn, Vec<oneshot::Sender<LogResult<()>>>>,
}

/// LSN-ordered flush waiters
pub struct FlushWaiters {
    state: Mutex<WaitersState>,
}

impl FlushWaiters {
    pub fn new(flushed_lsn: Lsn) -> Self {
        Self {
            state: Mutex::new(WaitersState {
                flushed_lsn,
                fault: None,
                waiters: BTreeMap::new(),
            }),
        }
    }

    /// Highest LSN known durable
    pub fn flushed_lsn(&self) -> Lsn {
        lock(&self.state).flushed_lsn
    }

    /// Wait until every record up to `lsn` is durable
    pub async fn wait_for(&self, lsn: Lsn) -> LogResult<()> {
        let receiver = {
            let mut state = lock(&self.state);
            if let Some(fault) = &state.fault {
                return Err(fault.clone());
            }
            if lsn <= state.flushed_lsn {
                return Ok(());
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.entry(lsn).or_default().push(sender);
            receiver
        };
        receiver.await.unwrap_or(Err(LogError::Closed))
    }

    /// A batch ending at `lsn` is durable
    pub fn notify_flushed(&self, lsn: Lsn) {
        let ready = {
            let mut state = lock(&self.state);
            if lsn <= state.flushed_lsn {
                return;
            }
            state.flushed_lsn = lsn;
            let remaining = state.waiters.split_off(&(lsn + 1));
            std::mem::replace(&mut state.waiters, remaining)
        };
        for sender in ready.into_values().flatten() {
            let _ = sender.send(Ok(()));
        }
    }

    /// A batch failed; fail every waiter now and later
    pub fn fail_all(&self, error: LogError) {
        let waiting = {
            let mut state = lock(&self.state);
            state.fault.get_or_insert(error.clone());
            std::mem::take(&mut state.waiters)
        };
        for sender in waiting.into_values().flatten() {
            let _ = sender.send(Err(error.clone()));
        }
    }

    /// Rewind after the tail moved back to `lsn`.
    ///
    /// Waiters above the new tail keep waiting for the records that will
    /// replace the truncated ones.
    pub fn reset(&self, lsn: Lsn) {
        let mut state = lock(&self.state);
        state.flushed_lsn = state.flushed_lsn.min(lsn);
    }
}
