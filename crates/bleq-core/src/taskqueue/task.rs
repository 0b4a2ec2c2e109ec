/*!
 * The synchronizing task primitive.
 */
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::Result;

/// One-shot completion latch handed to a [`Task`] when it starts.
///
/// The worker that ran the task suspends until some other code path
/// (typically a driver callback handler or a timeout handler) calls
/// [`Completion::complete`]. A signal sent before the worker reaches its
/// suspension point is still observed; it is never lost. Dropping every
/// clone without completing does not release the worker: a task that
/// never resolves parks the queue, and every task is expected to always
/// eventually resolve via success, failure, or timeout.
#[derive(Debug, Clone)]
pub struct Completion {
    tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl Completion {
    /// Create a latch and the receiver the worker suspends on
    pub(crate) fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Signal the latch, releasing the worker.
    ///
    /// Idempotent: only the first call per task run has any effect.
    pub fn complete(&self) {
        let Ok(mut slot) = self.tx.lock() else {
            return;
        };
        if let Some(tx) = slot.take() {
            trace!("task completion signaled");
            let _ = tx.send(());
        }
    }

    /// Whether the latch has already been signaled
    pub fn is_complete(&self) -> bool {
        self.tx.lock().map(|slot| slot.is_none()).unwrap_or(true)
    }
}

/// A unit of work whose completion is signaled externally.
///
/// `start` performs the actual asynchronous call (e.g. "issue read of
/// characteristic X") and returns immediately; some other code path must
/// eventually call `done.complete()`. The executor treats the pair as a
/// single blocking call.
#[async_trait]
pub trait Task: Send {
    /// Short label used in log output
    fn name(&self) -> &str {
        "task"
    }

    /// Issue the asynchronous work.
    ///
    /// An `Err` is caught and logged by the worker; it does not stop the
    /// executor, but the worker still waits for `done` to fire.
    async fn start(&mut self, done: Completion) -> Result<()>;
}

/// A boxed task as stored in the queue
pub type BoxedTask = Box<dyn Task>;
