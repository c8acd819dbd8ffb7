use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::batch::Batch;

#[derive(Error, Debug)]
pub enum QueueError {
    /// Every receiver is gone. The batch is handed back so it is not silently lost.
    #[error("batch queue has no receivers left")]
    Closed(Batch),
}

/// Result of waiting for a batch with a deadline.
#[derive(Debug)]
pub enum Dequeued {
    Batch(Batch),
    /// Nothing arrived in time; the queue is still open.
    Idle,
    /// The queue was closed and fully drained.
    Closed,
}

/// Create a bounded FIFO of batches with a single producer side and any number of
/// consumers. Closing (or dropping) the sender lets consumers drain and then stop.
pub fn bounded(capacity: usize) -> (BatchSender, BatchReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let depth = Arc::new(AtomicUsize::new(0));
    (
        BatchSender {
            tx,
            depth: depth.clone(),
        },
        BatchReceiver {
            rx: Arc::new(Mutex::new(rx)),
            depth,
        },
    )
}

fn report_depth(depth: usize) {
    metrics::gauge!("listen_import_queue_depth").set(depth as f64);
}

pub struct BatchSender {
    tx: mpsc::Sender<Batch>,
    // Batches sent and not yet taken, shared with the receivers.
    depth: Arc<AtomicUsize>,
}

impl BatchSender {
    /// Wait for a free slot and enqueue the batch.
    pub async fn send(&self, batch: Batch) -> Result<(), QueueError> {
        let Ok(permit) = self.tx.reserve().await else {
            return Err(QueueError::Closed(batch));
        };
        // Counted before the batch is visible so a receiver never takes it first.
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        permit.send(batch);
        report_depth(depth);
        Ok(())
    }

    /// Batches waiting for a writer.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal that no more batches will come.
    pub fn close(self) {
        drop(self.tx);
    }
}

#[derive(Clone)]
pub struct BatchReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Batch>>>,
    depth: Arc<AtomicUsize>,
}

impl BatchReceiver {
    /// Wait for the next batch. Returns `None` once the queue is closed and empty.
    pub async fn recv(&self) -> Option<Batch> {
        // Only hold the lock while taking one batch so other writers can pick up the next.
        let mut rx = self.rx.lock().await;
        let batch = rx.recv().await?;
        report_depth(self.depth.fetch_sub(1, Ordering::SeqCst) - 1);
        Some(batch)
    }

    /// Like `recv`, but gives up after `timeout` so the caller can do housekeeping.
    pub async fn recv_timeout(&self, timeout: Duration) -> Dequeued {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(Some(batch)) => Dequeued::Batch(batch),
            Ok(None) => Dequeued::Closed,
            Err(_) => Dequeued::Idle,
        }
    }
}
