use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Single-slot FIFO executor for all engine-bound work.
///
/// Every heavy operation (ASR, separation, transcode, zip) is funneled
/// through one of these, so at most one engine runs at a time no matter how
/// many HTTP requests are in flight. Depth is unbounded; flow control is the
/// caller's problem.
pub struct SerialQueue {
    tx: mpsc::UnboundedSender<BoxedTask>,
    pending: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub running: usize,
}

impl SerialQueue {
    pub fn new() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxedTask>();
        let pending = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));

        let worker_pending = pending.clone();
        let worker_running = running.clone();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                worker_pending.fetch_sub(1, Ordering::SeqCst);
                worker_running.store(1, Ordering::SeqCst);
                // run each task on its own tokio task so a panic does not
                // take the queue loop down with it
                if tokio::spawn(task).await.is_err() {
                    error!("engine task panicked; queue continues");
                }
                worker_running.store(0, Ordering::SeqCst);
            }
        });

        Arc::new(Self { tx, pending, running })
    }

    /// Enqueue a unit of work. The returned receiver resolves with the task's
    /// output once it has run; dropping it detaches the task (fire and
    /// forget), which is how the job/batch engines are dispatched.
    pub fn submit<F, T>(&self, fut: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::SeqCst);
        let task: BoxedTask = Box::pin(async move {
            let out = fut.await;
            let _ = done_tx.send(out);
        });
        if self.tx.send(task).is_err() {
            // queue loop is gone; only happens at shutdown
            self.pending.fetch_sub(1, Ordering::SeqCst);
            error!("serial queue is closed, dropping task");
        }
        done_rx
    }

    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            pending: self.pending.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
        }
    }
}
