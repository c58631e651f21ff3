//! Bounded FIFO queues connecting pipeline stages.
//!
//! Every queue carries [`StageMessage`]s: payload items and the shutdown control
//! message travel on the same channel so shutdown is ordered after everything that
//! was queued before it, and a legitimately empty payload can never be mistaken
//! for a shutdown request.

use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// An item travelling on a stage queue.
#[derive(Debug, Clone, PartialEq)]
pub enum StageMessage<T> {
    /// Payload to process.
    Item(T),
    /// Control message: finish the backlog ahead of this message, then stop.
    Shutdown,
}

impl<T> StageMessage<T> {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, StageMessage::Shutdown)
    }

    pub fn into_item(self) -> Option<T> {
        match self {
            StageMessage::Item(item) => Some(item),
            StageMessage::Shutdown => None,
        }
    }
}

/// The consuming side of the queue is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue closed")]
pub struct QueueClosed;

/// Failure of a non-suspending push. Returns the rejected item.
#[derive(PartialEq, Eq)]
pub enum TryPushError<T> {
    Full(T),
    Closed(T),
}

impl<T> TryPushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TryPushError::Full(item) | TryPushError::Closed(item) => item,
        }
    }
}

impl<T> fmt::Debug for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryPushError::Full(_) => f.write_str("Full(..)"),
            TryPushError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryPushError::Full(_) => write!(f, "queue full"),
            TryPushError::Closed(_) => write!(f, "queue closed"),
        }
    }
}

impl<T> std::error::Error for TryPushError<T> {}

/// Producer side of a stage queue.
pub struct QueueSender<T> {
    tx: mpsc::Sender<StageMessage<T>>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> fmt::Debug for QueueSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSender")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl<T> QueueSender<T> {
    /// Pushes an item, suspending while the queue is full.
    pub async fn push(&self, item: T) -> Result<(), QueueClosed> {
        self.tx
            .send(StageMessage::Item(item))
            .await
            .map_err(|_| QueueClosed)
    }

    /// Pushes an item without suspending.
    pub fn try_push(&self, item: T) -> Result<(), TryPushError<T>> {
        match self.tx.try_reserve() {
            Ok(permit) => {
                permit.send(StageMessage::Item(item));
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(())) => Err(TryPushError::Full(item)),
            Err(mpsc::error::TrySendError::Closed(())) => Err(TryPushError::Closed(item)),
        }
    }

    /// Queues the shutdown control message behind everything already queued.
    pub async fn shutdown(&self) -> Result<(), QueueClosed> {
        self.tx
            .send(StageMessage::Shutdown)
            .await
            .map_err(|_| QueueClosed)
    }

    /// Number of messages waiting to be consumed.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued messages.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// True once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of a stage queue.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<StageMessage<T>>,
}

impl<T> QueueReceiver<T> {
    /// Waits for the next message. `None` once every sender is gone and the queue is empty.
    ///
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<StageMessage<T>> {
        self.rx.recv().await
    }

    /// Takes the next message if one is ready.
    pub fn try_recv(&mut self) -> Option<StageMessage<T>> {
        self.rx.try_recv().ok()
    }

    /// Refuses further pushes; already queued messages can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Creates a bounded queue. A capacity of zero is raised to one.
pub fn queue<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (QueueSender { tx }, QueueReceiver { rx })
}
