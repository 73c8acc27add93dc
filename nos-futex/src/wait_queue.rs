//! Wait queue used by futex entries
//!
//! A thread first registers with [`WaitQueue::add`], which links a
//! [`Waiter`] into the queue, and only later blocks in [`Waiter::wait`].
//! A notification that arrives between the two is kept in the waiter and
//! returned by `wait` immediately, so callers may drop their locks after
//! registering without opening a lost-wakeup window.
//!
//! Notifiers unlink the waiter and publish its status while holding the
//! queue lock. A waiter that gives up (timeout or interrupt) unlinks itself
//! under the same lock; if it is no longer linked it was notified first and
//! takes the published status instead of its own error.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::error::{FutexError, Result};
use crate::flags::FutexFlags;

#[derive(Debug, Default)]
struct WaiterSlot {
    status: Mutex<Option<Result<()>>>,
    wakeup: Condvar,
    interruptible: AtomicBool,
    interrupted: AtomicBool,
}

impl WaiterSlot {
    fn status(&self) -> MutexGuard<'_, Option<Result<()>>> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, status: Result<()>) {
        *self.status() = Some(status);
        self.wakeup.notify_one();
    }
}

/// FIFO queue of blocked threads
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: spin::Mutex<VecDeque<Arc<WaiterSlot>>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the calling thread; it blocks later in [`Waiter::wait`]
    pub fn add(&self) -> Waiter<'_> {
        let slot = Arc::new(WaiterSlot::default());
        self.waiters.lock().push_back(slot.clone());
        Waiter {
            queue: self,
            slot,
            finished: false,
        }
    }

    /// Wake the oldest waiter with `status`; false if the queue was empty
    pub fn notify_one(&self, status: Result<()>) -> bool {
        let mut waiters = self.waiters.lock();
        match waiters.pop_front() {
            Some(slot) => {
                slot.publish(status);
                true
            }
            None => false,
        }
    }

    /// Wake every waiter with `status`, returning how many were woken
    pub fn notify_all(&self, status: Result<()>) -> usize {
        let mut waiters = self.waiters.lock();
        let count = waiters.len();
        for slot in waiters.drain(..) {
            slot.publish(status);
        }
        count
    }

    /// Interrupt every waiter that waits with `CAN_INTERRUPT`
    pub fn interrupt(&self) -> usize {
        let waiters = self.waiters.lock();
        let mut count = 0;
        for slot in waiters.iter() {
            slot.interrupted.store(true, Ordering::SeqCst);
            if slot.interruptible.load(Ordering::SeqCst) {
                // Take the status lock so the flag cannot slip between the
                // waiter's check and its condvar wait.
                drop(slot.status());
                slot.wakeup.notify_one();
                count += 1;
            }
        }
        count
    }

    /// Number of registered waiters
    pub fn count(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    // Unlink `slot`; false if a notifier already removed it.
    fn remove(&self, slot: &Arc<WaiterSlot>) -> bool {
        let mut waiters = self.waiters.lock();
        match waiters.iter().position(|s| Arc::ptr_eq(s, slot)) {
            Some(index) => {
                waiters.remove(index);
                true
            }
            None => false,
        }
    }
}

/// A registration in a [`WaitQueue`]
///
/// Dropping a waiter that never waited unlinks it from the queue.
#[derive(Debug)]
pub struct Waiter<'q> {
    queue: &'q WaitQueue,
    slot: Arc<WaiterSlot>,
    finished: bool,
}

impl Waiter<'_> {
    /// Block until notified, until `deadline` passes, or until interrupted
    /// when `flags` contains `CAN_INTERRUPT`.
    pub fn wait(mut self, flags: FutexFlags, deadline: Option<Instant>) -> Result<()> {
        self.finished = true;
        let interruptible = flags.contains(FutexFlags::CAN_INTERRUPT);
        self.slot.interruptible.store(interruptible, Ordering::SeqCst);

        let mut status = self.slot.status();
        loop {
            if let Some(result) = status.take() {
                return result;
            }
            if interruptible && self.slot.interrupted.load(Ordering::SeqCst) {
                drop(status);
                return self.give_up(FutexError::Interrupted);
            }
            status = match deadline {
                None => self
                    .slot
                    .wakeup
                    .wait(status)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(status);
                        return self.give_up(FutexError::TimedOut);
                    }
                    self.slot
                        .wakeup
                        .wait_timeout(status, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn give_up(&self, error: FutexError) -> Result<()> {
        if self.queue.remove(&self.slot) {
            return Err(error);
        }
        // Dequeued by a notifier, which published under the queue lock.
        self.slot.status().take().unwrap_or(Err(error))
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.queue.remove(&self.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_notify_before_wait_is_kept() {
        let queue = WaitQueue::new();
        let waiter = queue.add();
        assert_eq!(queue.count(), 1);
        assert!(queue.notify_one(Ok(())));
        assert!(queue.is_empty());
        assert_eq!(waiter.wait(FutexFlags::empty(), None), Ok(()));
    }

    #[test]
    fn test_notify_one_is_fifo() {
        let queue = WaitQueue::new();
        let first = queue.add();
        let second = queue.add();
        assert!(queue.notify_one(Err(FutexError::Interrupted)));
        assert_eq!(first.wait(FutexFlags::empty(), None), Err(FutexError::Interrupted));
        assert_eq!(queue.count(), 1);
        drop(second);
        assert!(queue.is_empty());
        assert!(!queue.notify_one(Ok(())));
    }

    #[test]
    fn test_timeout_unlinks_waiter() {
        let queue = WaitQueue::new();
        let waiter = queue.add();
        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(waiter.wait(FutexFlags::empty(), Some(deadline)), Err(FutexError::TimedOut));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_expired_deadline_still_sees_notification() {
        let queue = WaitQueue::new();
        let waiter = queue.add();
        queue.notify_one(Ok(()));
        assert_eq!(waiter.wait(FutexFlags::empty(), Some(Instant::now())), Ok(()));
    }

    #[test]
    fn test_notify_all_wakes_blocked_threads() {
        let queue = WaitQueue::new();
        thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let waiter = queue.add();
                    s.spawn(move || waiter.wait(FutexFlags::empty(), None))
                })
                .collect();
            assert_eq!(queue.notify_all(Ok(())), 4);
            for handle in handles {
                assert_eq!(handle.join().unwrap(), Ok(()));
            }
        });
    }

    #[test]
    fn test_interrupt_only_hits_interruptible_waiters() {
        let queue = WaitQueue::new();
        thread::scope(|s| {
            let plain = queue.add();
            let plain = s.spawn(move || plain.wait(FutexFlags::empty(), None));
            let soft = queue.add();
            let soft = s.spawn(move || soft.wait(FutexFlags::CAN_INTERRUPT, None));

            while !soft.is_finished() {
                queue.interrupt();
                thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(soft.join().unwrap(), Err(FutexError::Interrupted));
            assert_eq!(queue.count(), 1);
            assert!(queue.notify_one(Ok(())));
            assert_eq!(plain.join().unwrap(), Ok(()));
        });
    }
}
