use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;

/// A bounded FIFO handing out exclusive ownership of pooled objects.
///
/// The semaphore holds exactly one permit per queued item: waiting on it is how callers
/// suspend while the queue is empty, and tokio's semaphore serves waiters in arrival order.
pub(crate) struct LeaseQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Semaphore,
    capacity: usize,
}

impl<T> LeaseQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Semaphore::new(0),
            capacity,
        }
    }

    /// Take the oldest item, waiting for one to be pushed if the queue is empty.
    ///
    /// Cancel-safe: dropping the future before it resolves never loses an item.
    pub(crate) async fn pop(&self) -> T {
        loop {
            match self.available.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    debug_assert!(false, "the lease queue never closes its semaphore");
                    tokio::task::yield_now().await;
                }
            }
            if let Some(item) = self.take_front() {
                return item;
            }
        }
    }

    /// Take the oldest item if there is one.
    pub(crate) fn try_pop(&self) -> Option<T> {
        self.available.try_acquire().ok()?.forget();
        self.take_front()
    }

    /// Append an item, handing it back if the queue is already full.
    pub(crate) fn push(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.available.add_permits(1);
        Ok(())
    }

    /// Take every queued item, oldest first.
    pub(crate) fn drain(&self) -> Vec<T> {
        std::iter::from_fn(|| self.try_pop()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn take_front(&self) -> Option<T> {
        // Permits are only added after a push and consumed right before this call.
        let item = self.lock().pop_front();
        debug_assert!(item.is_some(), "a lease queue permit without a queued item");
        item
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
