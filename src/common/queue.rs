//! Message queues for inter-component communication.
//!
//! Provides both point-to-point (Queue) and broadcast (BroadcastQueue) messaging.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{ChatflowError, Result};

/// Bounded MPMC (multi-producer, multi-consumer) queue.
///
/// Used for the trigger processor partitions, where every event must be consumed
/// by exactly one worker. Backed by flume.
#[derive(Clone)]
pub struct Queue<T> {
    receiver: Arc<flume::Receiver<T>>,
    sender: Arc<flume::Sender<T>>,
}

impl<T> Queue<T> {
    /// create a new queue
    pub fn new(cap: usize) -> Arc<Self> {
        let (tx, rx) = flume::bounded(cap);

        Arc::new(Self {
            receiver: Arc::new(rx),
            sender: Arc::new(tx),
        })
    }

    /// send a message without waiting, failing when the queue is full
    pub fn try_send(
        &self,
        msg: T,
    ) -> std::result::Result<(), T> {
        self.sender.try_send(msg).map_err(|e| match e {
            flume::TrySendError::Full(msg) | flume::TrySendError::Disconnected(msg) => msg,
        })
    }

    /// take a message if one is queued
    pub fn try_next(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// receive a message from the queue asynchronously
    pub async fn next_async(&self) -> Option<T> {
        self.receiver.recv_async().await.ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Broadcast queue for one-to-many message distribution.
///
/// Used for execution events where all subscribers receive every message.
/// Backed by tokio's broadcast channel.
#[derive(Clone)]
pub struct BroadcastQueue<T> {
    sender: Arc<broadcast::Sender<T>>,
}

impl<T: Clone> BroadcastQueue<T> {
    /// create a new broadcast queue
    pub fn new(cap: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(cap);

        Arc::new(Self {
            sender: Arc::new(tx),
        })
    }

    /// send a message to the queue, a queue without subscribers drops it
    pub fn send(
        &self,
        msg: T,
    ) -> Result<()> {
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }
        self.sender.send(msg).map_err(|e| ChatflowError::Queue(e.to_string()))?;
        Ok(())
    }

    /// subscribe to the queue
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_send_full() {
        let queue = Queue::new(2);
        assert!(queue.try_send(1).is_ok());
        assert!(queue.try_send(2).is_ok());
        assert_eq!(queue.try_send(3), Err(3));
        assert_eq!(queue.len(), 2);

        // drop the oldest to make room
        assert_eq!(queue.try_next(), Some(1));
        assert!(queue.try_send(3).is_ok());
        assert_eq!(queue.try_next(), Some(2));
        assert_eq!(queue.try_next(), Some(3));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers() {
        let queue = BroadcastQueue::<u32>::new(4);
        assert!(queue.send(1).is_ok());

        let mut rx = queue.subscribe();
        queue.send(2).unwrap();
        assert_eq!(rx.recv().await.unwrap(), 2);
    }
}
