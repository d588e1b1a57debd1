//! Bounded outbound queue.
//!
//! Decouples response producers from the socket writer while enforcing a
//! per-connection byte cap. Enqueued items flow through an unbounded
//! in-channel into a batching task, which hands whole batches through a
//! single-slot channel to the dequeue side: one writer wakeup per burst
//! instead of one per item, FIFO order and per-item size accounting
//! preserved.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The byte cap would be exceeded; the item was not enqueued.
    #[error("queue full")]
    Full,
    /// The queue was closed and fully drained.
    #[error("queue closed")]
    Closed,
}

/// Anything with a byte size the queue can account for.
pub trait HasSize {
    fn size(&self) -> usize;
}

/// Producer half. Enqueueing never blocks; the byte cap is the only
/// backpressure and overflow is reported as [`QueueError::Full`].
#[derive(Debug)]
pub struct OutboxSender<T> {
    in_tx: Option<mpsc::UnboundedSender<T>>,
    total: Arc<AtomicI64>,
    max: i64,
}

/// Consumer half, held by the writer task.
#[derive(Debug)]
pub struct OutboxReceiver<T> {
    out_rx: mpsc::Receiver<Vec<T>>,
    pending: VecDeque<T>,
    total: Arc<AtomicI64>,
    done: bool,
}

/// Create a queue bounded at `max_bytes` and spawn its batching task.
pub fn channel<T: HasSize + Send + 'static>(
    max_bytes: usize,
) -> (OutboxSender<T>, OutboxReceiver<T>) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::channel(1);
    let total = Arc::new(AtomicI64::new(0));

    tokio::spawn(batch_loop(in_rx, out_tx));

    (
        OutboxSender {
            in_tx: Some(in_tx),
            total: total.clone(),
            max: max_bytes as i64,
        },
        OutboxReceiver {
            out_rx,
            pending: VecDeque::new(),
            total,
            done: false,
        },
    )
}

/// Accumulate bursty enqueues and transfer them batch-at-a-time whenever
/// the single handoff slot is free.
async fn batch_loop<T: HasSize>(mut in_rx: mpsc::UnboundedReceiver<T>, out_tx: mpsc::Sender<Vec<T>>) {
    let mut buffer: Vec<T> = Vec::new();
    loop {
        if buffer.is_empty() {
            match in_rx.recv().await {
                Some(item) => buffer.push(item),
                None => break,
            }
        } else {
            tokio::select! {
                item = in_rx.recv() => match item {
                    Some(item) => buffer.push(item),
                    None => break,
                },
                permit = out_tx.reserve() => match permit {
                    Ok(permit) => permit.send(std::mem::take(&mut buffer)),
                    Err(_) => return,
                },
            }
        }
    }
    if !buffer.is_empty() {
        let _ = out_tx.send(buffer).await;
    }
}

impl<T: HasSize> OutboxSender<T> {
    /// Enqueue `item` if it fits under the byte cap.
    ///
    /// The size reservation is atomic: concurrent enqueues cannot jointly
    /// overshoot the cap, and a rejected item leaves the total untouched.
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        let Some(in_tx) = &self.in_tx else {
            return Err(QueueError::Closed);
        };
        let size = item.size() as i64;
        let total = self.total.fetch_add(size, Ordering::AcqRel) + size;
        if total > self.max {
            self.total.fetch_sub(size, Ordering::AcqRel);
            return Err(QueueError::Full);
        }
        in_tx.send(item).map_err(|_| QueueError::Closed)
    }

    /// Signal end-of-stream. Items already enqueued remain dequeueable.
    /// Idempotent.
    pub fn close(&mut self) {
        self.in_tx = None;
    }
}

impl<T: HasSize> OutboxReceiver<T> {
    /// Next item in enqueue order; blocks until one is available or the
    /// queue is closed and drained.
    pub async fn dequeue(&mut self) -> Result<T, QueueError> {
        if self.done {
            return Err(QueueError::Closed);
        }
        if self.pending.is_empty() {
            match self.out_rx.recv().await {
                Some(batch) => self.pending = VecDeque::from(batch),
                None => {
                    self.done = true;
                    return Err(QueueError::Closed);
                }
            }
        }
        let item = self.pending.pop_front().expect("batches are non-empty");
        self.total.fetch_sub(item.size() as i64, Ordering::AcqRel);
        Ok(item)
    }

    /// Whether another item can be dequeued without blocking. The writer
    /// uses this to flush only when the queue drains.
    pub fn has_more(&mut self) -> bool {
        if self.done {
            return false;
        }
        if !self.pending.is_empty() {
            return true;
        }
        match self.out_rx.try_recv() {
            Ok(batch) => {
                self.pending = VecDeque::from(batch);
                true
            }
            Err(_) => false,
        }
    }
}
