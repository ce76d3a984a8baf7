//! Resolve-once, await-many completion signals
//!
//! Every record carries three of these (flushed, applied, processed). A signal
//! is resolved exactly once with either success or a captured failure, and any
//! number of tasks may await it before or after resolution. Resolving twice is
//! a coding error and panics.

use std::fmt;
use std::sync::{Mutex, OnceLock};

use futures_util::future::{FutureExt, Shared};
use tokio::sync::oneshot;

use crate::errors::{LogError, LogResult};
use crate::sync::lock;

/// Single-assignment broadcast future
pub struct CompletionSignal {
    sender: Mutex<Option<oneshot::Sender<LogResult<()>>>>,
    receiver: Shared<oneshot::Receiver<LogResult<()>>>,
    outcome: OnceLock<LogResult<()>>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: receiver.shared(),
            outcome: OnceLock::new(),
        }
    }

    /// Create a signal that is already resolved with `outcome`
    pub fn resolved(outcome: LogResult<()>) -> Self {
        let signal = Self::new();
        signal.resolve(outcome);
        signal
    }

    /// Resolve the signal and wake every waiter.
    ///
    /// # Panics
    ///
    /// Panics if the signal was already resolved.
    pub fn resolve(&self, outcome: LogResult<()>) {
        let sender = lock(&self.sender).take();
        let sender = match sender {
            Some(sender) => sender,
            None => panic!("completion signal resolved twice"),
        };
        // Set before sending so a woken waiter always observes the outcome.
        let _ = self.outcome.set(outcome.clone());
        // The shared receiver lives in `self`, so the send cannot fail.
        let _ = sender.send(outcome);
    }

    /// Whether `resolve` has been called
    pub fn is_resolved(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Outcome, if already resolved
    pub fn peek(&self) -> Option<LogResult<()>> {
        self.outcome.get().cloned()
    }

    /// Wait for the signal to be resolved
    pub async fn wait(&self) -> LogResult<()> {
        match self.receiver.clone().await {
            Ok(outcome) => outcome,
            Err(_) => Err(LogError::Closed),
        }
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("outcome", &self.outcome.get())
            .finish()
    }
}
