//! Operation flags and synchronization word encoding

use std::time::{Duration, Instant};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::error::{FutexError, Result};

/// Mutex word: lock is owned
pub const MUTEX_LOCKED: i32 = 0x01;
/// Mutex word: at least one thread may be queued in the kernel
pub const MUTEX_WAITING: i32 = 0x02;
/// Mutex word: pass-through mode, lock never blocks
pub const MUTEX_DISABLED: i32 = 0x04;
/// Every bit a mutex word may legitimately carry
pub const MUTEX_BITS: i32 = MUTEX_LOCKED | MUTEX_WAITING | MUTEX_DISABLED;

/// Semaphore word: zero permits, contention declared
pub const SEM_CONTENDED: i32 = -1;

const_assert_eq!(MUTEX_LOCKED & MUTEX_WAITING, 0);
const_assert_eq!((MUTEX_LOCKED | MUTEX_WAITING) & MUTEX_DISABLED, 0);
const_assert_eq!(std::mem::size_of::<std::sync::atomic::AtomicI32>(), 4);

bitflags! {
    /// Flags accepted by the futex entry points
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FutexFlags: u32 {
        /// Key the word by physical address in the global context
        const SHARED = 0x0001;
        /// Unblock wakes every waiter instead of handing off
        const UNBLOCK_ALL = 0x0002;
        /// Wait may be cut short by `Process::interrupt`
        const CAN_INTERRUPT = 0x0004;
        /// Timeout is relative to the time of the call
        const RELATIVE_TIMEOUT = 0x0008;
        /// Timeout is measured from system boot
        const ABSOLUTE_TIMEOUT = 0x0010;
    }
}

impl FutexFlags {
    /// Whether the word lives in the shared, physically keyed context
    pub fn is_shared(&self) -> bool {
        self.contains(FutexFlags::SHARED)
    }

    /// Convert `(flags, timeout)` into a wait deadline.
    ///
    /// Returns `None` when neither timeout flag is set (wait forever).
    pub fn deadline(&self, timeout: Duration, boot: Instant) -> Result<Option<Instant>> {
        let relative = self.contains(FutexFlags::RELATIVE_TIMEOUT);
        let absolute = self.contains(FutexFlags::ABSOLUTE_TIMEOUT);
        match (relative, absolute) {
            (true, true) => Err(FutexError::InvalidArgument("relative and absolute timeout")),
            (true, false) => Ok(Some(saturating_add(Instant::now(), timeout))),
            (false, true) => Ok(Some(saturating_add(boot, timeout))),
            (false, false) => Ok(None),
        }
    }
}

// Far-future deadlines behave like an infinite wait.
fn saturating_add(base: Instant, timeout: Duration) -> Instant {
    base.checked_add(timeout)
        .unwrap_or_else(|| base + Duration::from_secs(60 * 60 * 24 * 365))
}
