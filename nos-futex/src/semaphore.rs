//! Counting semaphore protocol
//!
//! Non-negative word values are available permits. `-1` means "no permits,
//! contention declared": it is set by the acquirer that takes the word from
//! zero and left in place until a release clears it. While the word is
//! negative, acquirers block without touching it.
//!
//! A release that wakes a waiter hands it the permit directly and does not
//! increment the count; once the queue drains it only turns the `-1` back
//! into `0`. A release that finds nobody queued increments the count,
//! undoing the sentinel first if it is set.

use std::time::Instant;

use crate::error::{FutexError, Result};
use crate::flags::{FutexFlags, SEM_CONTENDED};
use crate::resolve::Resolved;

pub(crate) fn acquire(sem: &Resolved<'_>, flags: FutexFlags, deadline: Option<Instant>) -> Result<()> {
    let entry = sem.table.get_or_create(sem.key)?;
    let word = sem.word();

    let waiter = {
        let _reader = entry.lock.read();
        let mut old = word.get()?;
        while old > SEM_CONTENDED {
            let value = word.cas(old - 1, old)?;
            if value == old {
                if old > 0 {
                    return Ok(());
                }
                // Took the word from 0 to -1: contention declared.
                break;
            }
            old = value;
        }
        entry.condition.add()
    };

    log::trace!("futex: blocking on semaphore {:#x}", sem.key);
    waiter.wait(flags, deadline)
}

pub(crate) fn release(sem: &Resolved<'_>) -> Result<()> {
    let entry = sem.table.get_or_create(sem.key)?;
    let word = sem.word();
    let _writer = entry.lock.write();

    if entry.condition.notify_one(Ok(())) {
        if entry.condition.is_empty() {
            word.cas(0, SEM_CONTENDED)?;
        }
        return Ok(());
    }

    let mut old = word.get()?;
    loop {
        if old == i32::MAX {
            return Err(FutexError::InvalidState("semaphore count overflow"));
        }
        let new = if old < 0 { old + 2 } else { old + 1 };
        let value = word.cas(new, old)?;
        if value == old {
            return Ok(());
        }
        old = value;
    }
}
