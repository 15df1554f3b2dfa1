// Bounded pool of reusable workers with in-flight tracking for drain.
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

/// Fixed-capacity set of pre-built workers.
///
/// At most `capacity` workers are checked out at once. `acquire` suspends until
/// one is parked; dropping (or releasing) the returned [`Checkout`] parks it
/// again and wakes one waiter.
#[derive(Debug)]
pub struct WorkerPool<W> {
    idle: Mutex<Vec<W>>,
    capacity: usize,
    in_flight: AtomicUsize,
    available: Notify,
    drained: Notify,
}

impl<W> WorkerPool<W> {
    /// Build `capacity` workers up front. A capacity of zero is raised to one.
    pub fn new(capacity: usize, mut factory: impl FnMut() -> W) -> Arc<Self> {
        let capacity = capacity.max(1);
        let idle = (0..capacity).map(|_| factory()).collect();
        Arc::new(Self {
            idle: Mutex::new(idle),
            capacity,
            in_flight: AtomicUsize::new(0),
            available: Notify::new(),
            drained: Notify::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Workers currently parked in the free set.
    pub fn idle_count(&self) -> usize {
        self.idle_guard().len()
    }

    /// Workers currently checked out.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub async fn acquire(self: &Arc<Self>) -> Checkout<W> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(worker) = self.idle_guard().pop() {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                return Checkout {
                    pool: Arc::clone(self),
                    worker: Some(worker),
                };
            }
            notified.await;
        }
    }

    /// Wait until no worker is checked out. Does not wait for anything else.
    pub async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Take every parked worker out of the pool, for orderly teardown.
    pub fn take_idle(&self) -> Vec<W> {
        std::mem::take(&mut *self.idle_guard())
    }

    fn release(&self, worker: W) {
        self.idle_guard().push(worker);
        self.available.notify_one();
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    fn idle_guard(&self) -> std::sync::MutexGuard<'_, Vec<W>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive ownership of one worker; returns it to the pool on drop.
#[derive(Debug)]
pub struct Checkout<W> {
    pool: Arc<WorkerPool<W>>,
    worker: Option<W>,
}

impl<W> Checkout<W> {
    pub fn release(self) {
        drop(self);
    }
}

impl<W> Deref for Checkout<W> {
    type Target = W;

    fn deref(&self) -> &W {
        match &self.worker {
            Some(worker) => worker,
            None => unreachable!("worker is present until drop"),
        }
    }
}

impl<W> DerefMut for Checkout<W> {
    fn deref_mut(&mut self) -> &mut W {
        match &mut self.worker {
            Some(worker) => worker,
            None => unreachable!("worker is present until drop"),
        }
    }
}

impl<W> Drop for Checkout<W> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker);
        }
    }
}
