use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Every consumer is gone; nothing will ever drain the item.
    Disconnected,
    /// The pass was aborted by a failing worker.
    Aborted,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Disconnected => write!(f, "no consumer left on the work queue"),
            QueueError::Aborted => write!(f, "work queue aborted"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Bounded multi-producer/multi-consumer work queue.
///
/// Termination is carried by the channel itself: once every [`WorkSender`]
/// is dropped, consumers drain what is left and then see an empty dequeue.
/// Dropping every [`WorkReceiver`] releases producers blocked on a full queue.
/// Either side can abort, after which both ends stop handing out work.
pub fn work_queue<T>(capacity: usize) -> (WorkSender<T>, WorkReceiver<T>) {
    let (sender, receiver) = bounded(capacity.max(1));
    let aborted = Arc::new(AtomicBool::new(false));
    (
        WorkSender {
            sender,
            aborted: Arc::clone(&aborted),
        },
        WorkReceiver { receiver, aborted },
    )
}

pub struct WorkSender<T> {
    sender: Sender<T>,
    aborted: Arc<AtomicBool>,
}

impl<T> Clone for WorkSender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            aborted: Arc::clone(&self.aborted),
        }
    }
}

impl<T> WorkSender<T> {
    /// Blocks while the queue is full.
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        if self.is_aborted() {
            return Err(QueueError::Aborted);
        }
        self.sender.send(item).map_err(|_| {
            if self.is_aborted() {
                QueueError::Aborted
            } else {
                QueueError::Disconnected
            }
        })
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

pub struct WorkReceiver<T> {
    receiver: Receiver<T>,
    aborted: Arc<AtomicBool>,
}

impl<T> Clone for WorkReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            aborted: Arc::clone(&self.aborted),
        }
    }
}

impl<T> WorkReceiver<T> {
    /// Blocks for a first item, then takes whatever else is immediately
    /// available, up to `max` items in total.
    ///
    /// Empty once every sender is gone and the queue is drained, or once the
    /// queue is aborted.
    pub fn dequeue_bulk(&self, max: usize) -> Vec<T> {
        let mut items = Vec::new();
        if max == 0 || self.is_aborted() {
            return items;
        }
        match self.receiver.recv() {
            Ok(item) => items.push(item),
            Err(_) => return items,
        }
        if self.is_aborted() {
            return Vec::new();
        }
        while items.len() < max {
            match self.receiver.try_recv() {
                Ok(item) => items.push(item),
                Err(_) => break,
            }
        }
        items
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
