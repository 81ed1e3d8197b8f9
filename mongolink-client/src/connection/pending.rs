//! The bounded queue of requests awaiting replies.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use mongolink_core::wire::Message;
use mongolink_core::{Error, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::callback::ReplyCallback;
use crate::config::LockType;

/// A request that has been written (or is being written) and is waiting
/// for its reply.
#[derive(Debug)]
pub struct PendingMessage {
    message_id: i32,
    message: Arc<dyn Message>,
    callback: Option<Box<dyn ReplyCallback>>,
    sent_at: Instant,
}

impl PendingMessage {
    /// Creates a pending record stamped with the current time.
    pub fn new(
        message_id: i32,
        message: Arc<dyn Message>,
        callback: Option<Box<dyn ReplyCallback>>,
    ) -> Self {
        Self {
            message_id,
            message,
            callback,
            sent_at: Instant::now(),
        }
    }

    /// The request id assigned at send time.
    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// The original message, retained for error reporting.
    pub fn message(&self) -> &Arc<dyn Message> {
        &self.message
    }

    /// Time since the message was stamped for sending.
    pub fn latency(&self) -> std::time::Duration {
        self.sent_at.elapsed()
    }

    /// Consumes the record, yielding its callback.
    pub fn into_callback(self) -> Option<Box<dyn ReplyCallback>> {
        self.callback
    }
}

/// Bounded MPSC queue of [`PendingMessage`]s.
///
/// Producers reserve capacity (awaiting when the queue is full), then
/// push while holding the connection's send ordering lock. The receive
/// task polls without blocking. [`LockType`] selects how the inner
/// mutex is taken.
#[derive(Debug)]
pub struct PendingQueue {
    entries: Mutex<VecDeque<PendingMessage>>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    lock_type: LockType,
}

impl PendingQueue {
    /// Creates a queue bounded to `capacity` entries.
    pub fn new(capacity: usize, lock_type: LockType) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            lock_type,
        }
    }

    /// Returns the queue's capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits for a free slot. Fails once the queue is closed.
    pub async fn reserve(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Shutdown("pending queue is closed".to_string()))
    }

    /// Claims a free slot without waiting.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Enqueues under a previously reserved slot.
    pub fn push(&self, permit: OwnedSemaphorePermit, message: PendingMessage) {
        permit.forget();
        self.lock().push_back(message);
    }

    /// Dequeues the oldest entry, freeing its slot. Never blocks on a
    /// full queue; lock acquisition follows the configured
    /// [`LockType`].
    pub fn poll(&self) -> Option<PendingMessage> {
        let message = self.lock().pop_front();
        if message.is_some() {
            self.semaphore.add_permits(1);
        }
        message
    }

    /// Returns the number of queued entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no entries are queued.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Closes the queue; waiting producers fail and no new slots can be
    /// reserved. Queued entries remain pollable for draining.
    pub fn close(&self) {
        self.semaphore.close();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingMessage>> {
        match self.lock_type {
            LockType::Mutex => self.entries.lock().unwrap(),
            LockType::LowLatency => loop {
                match self.entries.try_lock() {
                    Ok(guard) => break guard,
                    Err(std::sync::TryLockError::WouldBlock) => std::hint::spin_loop(),
                    Err(poisoned) => panic!("pending queue lock poisoned: {poisoned}"),
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::FutureCallback;
    use mongolink_core::wire::Command;

    fn pending(id: i32) -> PendingMessage {
        let (callback, _receiver) = FutureCallback::new();
        PendingMessage::new(id, Arc::new(Command::is_master()), Some(Box::new(callback)))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = PendingQueue::new(4, LockType::Mutex);
        for id in 1..=3 {
            let permit = queue.try_reserve().unwrap();
            queue.push(permit, pending(id));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.poll().unwrap().message_id(), 1);
        assert_eq!(queue.poll().unwrap().message_id(), 2);
        assert_eq!(queue.poll().unwrap().message_id(), 3);
        assert!(queue.poll().is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let queue = PendingQueue::new(2, LockType::Mutex);
        let a = queue.try_reserve().unwrap();
        let b = queue.try_reserve().unwrap();
        assert!(queue.try_reserve().is_none());

        queue.push(a, pending(1));
        queue.push(b, pending(2));

        // Polling frees a slot.
        queue.poll().unwrap();
        assert!(queue.try_reserve().is_some());
    }

    #[tokio::test]
    async fn test_reserve_waits_for_free_slot() {
        let queue = Arc::new(PendingQueue::new(1, LockType::Mutex));
        let permit = queue.try_reserve().unwrap();
        queue.push(permit, pending(1));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let permit = queue.reserve().await.unwrap();
                queue.push(permit, pending(2));
            })
        };

        tokio::task::yield_now().await;
        assert_eq!(queue.len(), 1);

        queue.poll().unwrap();
        waiter.await.unwrap();
        assert_eq!(queue.poll().unwrap().message_id(), 2);
    }

    #[tokio::test]
    async fn test_close_fails_waiting_producers() {
        let queue = Arc::new(PendingQueue::new(1, LockType::Mutex));
        let permit = queue.try_reserve().unwrap();
        queue.push(permit, pending(1));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.reserve().await })
        };

        tokio::task::yield_now().await;
        queue.close();

        assert!(matches!(waiter.await.unwrap(), Err(Error::Shutdown(_))));
        // Existing entries still drain.
        assert!(queue.poll().is_some());
    }

    #[tokio::test]
    async fn test_low_latency_lock_variant() {
        let queue = PendingQueue::new(4, LockType::LowLatency);
        let permit = queue.try_reserve().unwrap();
        queue.push(permit, pending(7));
        assert_eq!(queue.poll().unwrap().message_id(), 7);
    }

    #[tokio::test]
    async fn test_latency_measured_from_creation() {
        let message = pending(1);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(message.latency() >= std::time::Duration::from_millis(5));
    }
}
