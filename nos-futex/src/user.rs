//! User-level halves of the mutex and semaphore protocols
//!
//! These are what a C library would wrap around the system calls: the
//! uncontended paths run entirely on the word and the kernel is entered only
//! to block or to wake.

use std::time::Duration;

use crate::atomic::{AtomicWord, UserWord};
use crate::error::Result;
use crate::flags::{FutexFlags, MUTEX_LOCKED, MUTEX_WAITING};
use crate::system::Process;

/// A mutex word in a process's memory
#[derive(Debug, Clone, Copy)]
pub struct UserMutex<'p> {
    process: &'p Process,
    addr: usize,
    flags: FutexFlags,
}

impl<'p> UserMutex<'p> {
    /// `flags` is `SHARED` for a mutex in shared memory, empty otherwise
    pub fn new(process: &'p Process, addr: usize, flags: FutexFlags) -> Self {
        Self { process, addr, flags }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    fn word(&self) -> UserWord<'p> {
        UserWord::new(self.process.address_space(), self.addr)
    }

    pub fn try_lock(&self) -> Result<bool> {
        Ok(self.word().cas(MUTEX_LOCKED, 0)? == 0)
    }

    pub fn lock(&self) -> Result<()> {
        self.lock_with(FutexFlags::empty(), Duration::ZERO)
    }

    /// Lock, passing wait flags and timeout through to the kernel
    pub fn lock_with(&self, flags: FutexFlags, timeout: Duration) -> Result<()> {
        if self.try_lock()? {
            return Ok(());
        }
        self.process.mutex_lock(self.addr, self.flags | flags, timeout)
    }

    pub fn unlock(&self) -> Result<()> {
        let old = self.word().and(!MUTEX_LOCKED)?;
        if old & MUTEX_WAITING != 0 {
            return self.process.mutex_unblock(self.addr, self.flags);
        }
        Ok(())
    }

    /// Release this mutex and lock `next`, as a condition variable wait does
    pub fn switch_to(&self, next: &UserMutex<'_>, flags: FutexFlags, timeout: Duration) -> Result<()> {
        self.process
            .mutex_switch_lock(self.addr, self.flags, next.addr, next.flags | flags, timeout)
    }
}

/// A counting semaphore word in a process's memory
#[derive(Debug, Clone, Copy)]
pub struct UserSemaphore<'p> {
    process: &'p Process,
    addr: usize,
    flags: FutexFlags,
}

impl<'p> UserSemaphore<'p> {
    pub fn new(process: &'p Process, addr: usize, flags: FutexFlags) -> Self {
        Self { process, addr, flags }
    }

    fn word(&self) -> UserWord<'p> {
        UserWord::new(self.process.address_space(), self.addr)
    }

    /// Take a permit if one is available without entering the kernel
    pub fn try_acquire(&self) -> Result<bool> {
        let word = self.word();
        let mut value = word.get()?;
        while value > 0 {
            let current = word.cas(value - 1, value)?;
            if current == value {
                return Ok(true);
            }
            value = current;
        }
        Ok(false)
    }

    pub fn acquire(&self) -> Result<()> {
        self.acquire_with(FutexFlags::empty(), Duration::ZERO)
    }

    pub fn acquire_with(&self, flags: FutexFlags, timeout: Duration) -> Result<()> {
        if self.try_acquire()? {
            return Ok(());
        }
        self.process.sem_acquire(self.addr, self.flags | flags, timeout)
    }

    pub fn release(&self) -> Result<()> {
        let word = self.word();
        let mut value = word.get()?;
        loop {
            // Negative: waiters may be queued. MAX: let the kernel reject it.
            if value < 0 || value == i32::MAX {
                return self.process.sem_release(self.addr, self.flags);
            }
            let current = word.cas(value + 1, value)?;
            if current == value {
                return Ok(());
            }
            value = current;
        }
    }
}
