/*!
 * The sequential task queue executor.
 */
use std::sync::Mutex;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use super::task::{BoxedTask, Completion};
use crate::error::{Error, Result};

/// Executor that runs submitted tasks strictly one at a time, in
/// submission order, on a single worker.
///
/// The queue is bounded: capacity is fixed at construction and a full
/// queue rejects new submissions with [`Error::QueueFull`] instead of
/// blocking the caller. The worker dequeues the head task, invokes its
/// `start`, and then suspends on the task's [`Completion`] latch; the
/// next task never begins before the current one signals.
#[derive(Debug)]
pub struct TaskExecutor {
    tx: mpsc::Sender<BoxedTask>,
    rx: Mutex<Option<mpsc::Receiver<BoxedTask>>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskExecutor {
    /// Create an executor with the given queue capacity.
    ///
    /// The worker is not running until [`TaskExecutor::start`] is called;
    /// submissions made before that are queued.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            shutdown_tx,
            worker: Mutex::new(None),
        }
    }

    /// Enqueue a task.
    ///
    /// Fails with [`Error::QueueFull`] when the queue is at capacity and
    /// with [`Error::ExecutorStopped`] after [`TaskExecutor::shutdown`];
    /// in both cases the task is never run. An accepted submission wakes
    /// the worker if it was idle.
    pub fn submit(&self, task: BoxedTask) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(Error::ExecutorStopped);
        }
        trace!("submitting task '{}'", task.name());
        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Error::ExecutorStopped,
        })
    }

    /// Start the worker loop. Idempotent: calling again while running is
    /// a no-op.
    pub fn start(&self) {
        let Ok(mut worker) = self.worker.lock() else {
            return;
        };
        if worker.is_some() {
            return;
        }
        let Ok(mut rx_slot) = self.rx.lock() else {
            return;
        };
        let Some(rx) = rx_slot.take() else {
            return;
        };
        let shutdown_rx = self.shutdown_tx.subscribe();
        worker.replace(tokio::spawn(worker_loop(rx, shutdown_rx)));
    }

    /// Whether the worker has been started and not shut down
    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
            && self
                .worker
                .lock()
                .map(|w| w.is_some())
                .unwrap_or(false)
    }

    /// Signal the worker to exit and stop accepting submissions.
    ///
    /// A worker blocked waiting for tasks is woken immediately; a worker
    /// suspended inside a running task finishes that task first. Tasks
    /// still queued are discarded.
    pub fn shutdown(&self) {
        debug!("executor shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }
}

async fn worker_loop(mut rx: mpsc::Receiver<BoxedTask>, mut shutdown: watch::Receiver<bool>) {
    debug!("executor worker started");
    loop {
        let mut task = tokio::select! {
            _ = shutdown.changed() => break,
            next = rx.recv() => match next {
                Some(task) => task,
                None => break,
            },
        };

        debug!("executing task '{}'", task.name());
        let (done, latch) = Completion::new();
        if let Err(e) = task.start(done.clone()).await {
            error!("task '{}' failed to start: {}", task.name(), e);
        }
        // The worker keeps `done` alive while suspended, so the latch
        // only opens when some completion path calls complete().
        let _ = latch.await;
        trace!("task '{}' finished", task.name());
    }
    debug!("executor worker stopped");
}
