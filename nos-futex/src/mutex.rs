//! User mutex protocol: lock, unblock and switch-lock
//!
//! The word carries `LOCKED`, `WAITING` and `DISABLED`. User code takes an
//! uncontended lock itself; the kernel side is entered to block, and the
//! releasing thread enters it only when `WAITING` is set. Unblock hands the
//! lock directly to the oldest waiter: it re-sets `LOCKED` on the waiter's
//! behalf, so the woken thread returns owning the lock.
//!
//! Enqueueing happens under the entry's read lock and waking under its write
//! lock, so an unblock never observes a half-registered waiter.

use std::time::Instant;

use crate::atomic::AtomicWord;
use crate::error::{FutexError, Result};
use crate::flags::{FutexFlags, MUTEX_BITS, MUTEX_DISABLED, MUTEX_LOCKED, MUTEX_WAITING};
use crate::resolve::Resolved;
use crate::table::Entry;
use crate::wait_queue::Waiter;

fn check_state(word: &dyn AtomicWord) -> Result<()> {
    if word.get()? & !MUTEX_BITS != 0 {
        return Err(FutexError::InvalidState("not a mutex word"));
    }
    Ok(())
}

/// Try the lock; on contention register a waiter and return it.
fn lock_or_enqueue<'e>(word: &dyn AtomicWord, entry: &'e Entry) -> Result<Option<Waiter<'e>>> {
    let reader = entry.lock.read();
    let old = word.or(MUTEX_LOCKED | MUTEX_WAITING)?;
    if old & MUTEX_LOCKED == 0 || old & MUTEX_DISABLED != 0 {
        if old & MUTEX_WAITING == 0 {
            // We set WAITING ourselves; drop it again unless someone queued.
            drop(reader);
            let _writer = entry.lock.write();
            if entry.condition.is_empty() {
                word.and(!MUTEX_WAITING)?;
            }
        }
        return Ok(None);
    }
    Ok(Some(entry.condition.add()))
}

fn finish_wait(word: &dyn AtomicWord, entry: &Entry, result: Result<()>) -> Result<()> {
    if result.is_err() && entry.condition.is_empty() {
        let _writer = entry.lock.write();
        if entry.condition.is_empty() {
            // Best effort: the wait outcome is what the caller needs to see.
            let _ = word.and(!MUTEX_WAITING);
        }
    }
    result
}

/// Hand off or clear contention; the caller holds the entry's write lock.
fn unblock_locked(word: &dyn AtomicWord, entry: &Entry, flags: FutexFlags) -> Result<()> {
    if entry.condition.is_empty() {
        word.and(!MUTEX_WAITING)?;
        return Ok(());
    }

    let mut old = 0;
    if !flags.contains(FutexFlags::UNBLOCK_ALL) {
        old = word.or(MUTEX_LOCKED)?;
        if old & MUTEX_LOCKED != 0 {
            // A fast-path locker got there first and inherits the duty.
            return Ok(());
        }
    }

    if flags.contains(FutexFlags::UNBLOCK_ALL) || old & MUTEX_DISABLED != 0 {
        let woken = entry.condition.notify_all(Ok(()));
        log::trace!("futex: unblocked all {} waiters on {:#x}", woken, entry.address());
    } else if !entry.condition.notify_one(Ok(())) {
        // The waiter gave up in the meantime; nobody to hand off to.
        word.and(!MUTEX_LOCKED)?;
    }

    if entry.condition.is_empty() {
        word.and(!MUTEX_WAITING)?;
    }
    Ok(())
}

pub(crate) fn lock(mutex: &Resolved<'_>, flags: FutexFlags, deadline: Option<Instant>) -> Result<()> {
    let entry = mutex.table.get_or_create(mutex.key)?;
    let word = mutex.word();
    check_state(word)?;
    match lock_or_enqueue(word, &entry)? {
        None => Ok(()),
        Some(waiter) => {
            log::trace!("futex: blocking on mutex {:#x}", mutex.key);
            finish_wait(word, &entry, waiter.wait(flags, deadline))
        }
    }
}

pub(crate) fn unblock(mutex: &Resolved<'_>, flags: FutexFlags) -> Result<()> {
    let entry = mutex.table.get_or_create(mutex.key)?;
    let _writer = entry.lock.write();
    unblock_locked(mutex.word(), &entry, flags)
}

/// Release `from` and acquire `to` without a lost-wakeup window.
pub(crate) fn switch_lock(
    from: &Resolved<'_>,
    from_flags: FutexFlags,
    to: &Resolved<'_>,
    to_flags: FutexFlags,
    deadline: Option<Instant>,
) -> Result<()> {
    let to_entry = to.table.get_or_create(to.key)?;
    check_state(to.word())?;

    // Registered before `from` is touched: any hand-off of `to` from here
    // on finds this waiter.
    let waiter = lock_or_enqueue(to.word(), &to_entry)?;

    match from.word().and(!MUTEX_LOCKED) {
        Ok(old) if old & MUTEX_WAITING != 0 => {
            if let Some(from_entry) = from.table.lookup(from.key, true, None)? {
                let _writer = from_entry.lock.write();
                if let Err(error) = unblock_locked(from.word(), &from_entry, from_flags) {
                    log::warn!("futex: switch-lock could not unblock {:#x}: {}", from.key, error);
                }
            }
        }
        Ok(_) => {}
        Err(error) => {
            log::warn!("futex: switch-lock could not release {:#x}: {}", from.key, error);
        }
    }

    match waiter {
        None => Ok(()),
        Some(waiter) => {
            log::trace!("futex: switch-lock blocking on {:#x}", to.key);
            finish_wait(to.word(), &to_entry, waiter.wait(to_flags, deadline))
        }
    }
}
