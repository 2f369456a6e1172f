use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;

use crate::error::{LoggerError, LoggerResult};
use crate::record::LogRecord;

/// Count of records shed because the queue was full. Only the sampler
/// increments it; everyone else reads.
#[derive(Clone, Debug, Default)]
pub struct DropCounter(Arc<AtomicU64>);

impl DropCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new total.
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Create the bounded sampler→writer queue.
pub fn sample_queue(capacity: usize) -> LoggerResult<(QueueProducer, QueueConsumer)> {
    if capacity == 0 {
        return Err(LoggerError::InvalidConfig(
            "sample queue capacity must be at least 1".to_string(),
        ));
    }
    let (tx, rx) = mpsc::channel(capacity);
    Ok((QueueProducer { tx }, QueueConsumer { rx }))
}

/// Producer half. Never blocks.
#[derive(Clone)]
pub struct QueueProducer {
    tx: mpsc::Sender<LogRecord>,
}

impl QueueProducer {
    /// Returns false when the record was dropped; the caller counts it.
    pub fn try_push(&self, record: LogRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Records currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consumer half, owned by the writer.
pub struct QueueConsumer {
    rx: mpsc::Receiver<LogRecord>,
}

impl QueueConsumer {
    /// Wait up to `wait` for the next record. Cancel-safe.
    pub async fn pop_wait(&mut self, wait: Duration) -> Option<LogRecord> {
        match timeout(wait, self.rx.recv()).await {
            Ok(Some(record)) => Some(record),
            // Every producer is gone; still honour the wait so callers polling
            // in a loop do not spin.
            Ok(None) => {
                tokio::time::sleep(wait).await;
                None
            }
            Err(_) => None,
        }
    }

    pub fn try_pop(&mut self) -> Option<LogRecord> {
        self.rx.try_recv().ok()
    }
}
