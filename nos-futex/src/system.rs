//! Futex contexts and the public entry points
//!
//! [`FutexSystem`] owns the state created once at start-up: the shared
//! context (keyed by physical address), the boot clock that absolute
//! timeouts are measured from, and the allocator handing out simulated
//! physical memory. Each [`Process`] owns its address space and a private
//! context (keyed by virtual address) that is created on first use and torn
//! down with the process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::config::FutexConfig;
use crate::error::{FutexError, Result};
use crate::flags::FutexFlags;
use crate::mm::{AddressSpace, PAGE_SIZE, Segment, WORD_SIZE};
use crate::resolve::{Resolved, resolve};
use crate::table::Table;
use crate::{mutex, semaphore};

/// First simulated physical address handed out
const PHYS_MEMORY_START: usize = 0x10_0000;

/// System-wide futex state
#[derive(Debug)]
pub struct FutexSystem {
    config: FutexConfig,
    shared: Table,
    boot: Instant,
    next_phys: AtomicUsize,
    next_pid: AtomicU32,
}

impl FutexSystem {
    pub fn new() -> Arc<Self> {
        Self::with_config(FutexConfig::default())
    }

    pub fn with_config(config: FutexConfig) -> Arc<Self> {
        log::debug!("futex: system context created ({:?})", config);
        Arc::new(Self {
            config,
            shared: Table::with_capacity(config.shared_table_capacity),
            boot: Instant::now(),
            next_phys: AtomicUsize::new(PHYS_MEMORY_START),
            next_pid: AtomicU32::new(1),
        })
    }

    pub fn config(&self) -> &FutexConfig {
        &self.config
    }

    /// Instant that `ABSOLUTE_TIMEOUT` values are measured from
    pub fn boot_time(&self) -> Instant {
        self.boot
    }

    /// Allocate a segment of `len_words` zeroed words
    pub fn create_segment(&self, len_words: usize) -> Result<Arc<Segment>> {
        let pages = len_words
            .checked_mul(WORD_SIZE)
            .map(|bytes| bytes.div_ceil(PAGE_SIZE))
            .ok_or(FutexError::NoMemory)?;
        let span = pages.checked_mul(PAGE_SIZE).ok_or(FutexError::NoMemory)?;
        let phys_base = self.next_phys.fetch_add(span, Ordering::Relaxed);
        Ok(Arc::new(Segment::new(phys_base, len_words)?))
    }

    /// Number of live entries in the shared context
    pub fn shared_entries(&self) -> usize {
        self.shared.len()
    }

    /// Create a process attached to this system
    pub fn spawn_process(self: &Arc<Self>) -> Process {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        Process {
            pid,
            system: self.clone(),
            space: AddressSpace::new(),
            private: spin::Once::new(),
        }
    }
}

/// A process: an address space plus its private futex context
#[derive(Debug)]
pub struct Process {
    pid: u32,
    system: Arc<FutexSystem>,
    space: AddressSpace,
    private: spin::Once<Table>,
}

impl Process {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn system(&self) -> &Arc<FutexSystem> {
        &self.system
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    /// Allocate private memory and return the address of its first word
    pub fn allocate(&self, len_words: usize) -> Result<usize> {
        let segment = self.system.create_segment(len_words)?;
        self.space.map(segment, true)
    }

    /// Map a shared segment, returning its base address
    pub fn map_shared(&self, segment: &Arc<Segment>) -> Result<usize> {
        self.space.map(segment.clone(), true)
    }

    pub fn unmap(&self, base: usize) -> Result<()> {
        self.space.unmap(base).map(|_| ())
    }

    /// Read a word the way user code would
    pub fn load(&self, addr: usize) -> Result<i32> {
        self.space.with_word(addr, false, |w| w.load(Ordering::SeqCst))
    }

    /// Write a word the way user code would
    pub fn store(&self, addr: usize, value: i32) -> Result<()> {
        self.space.with_word(addr, true, |w| w.store(value, Ordering::SeqCst))
    }

    /// Number of live entries in this process's private context
    pub fn private_entries(&self) -> usize {
        self.private.get().map_or(0, Table::len)
    }

    /// Block until the mutex at `addr` is handed to us or acquired.
    ///
    /// Succeeds immediately when the word is unlocked or disabled.
    pub fn mutex_lock(&self, addr: usize, flags: FutexFlags, timeout: Duration) -> Result<()> {
        let deadline = flags.deadline(timeout, self.system.boot)?;
        let resolved = self.resolve(addr, flags)?;
        mutex::lock(&resolved, flags, deadline)
    }

    /// Wake a waiter of the mutex at `addr`, handing it the lock, or all
    /// waiters with `UNBLOCK_ALL`.
    pub fn mutex_unblock(&self, addr: usize, flags: FutexFlags) -> Result<()> {
        let resolved = self.resolve(addr, flags)?;
        mutex::unblock(&resolved, flags)
    }

    /// Release the mutex at `from` and lock the one at `to`.
    ///
    /// The thread is registered as a waiter on `to` before `from` is
    /// released. The timeout applies to `to` and is interpreted with
    /// `to_flags`.
    pub fn mutex_switch_lock(
        &self,
        from: usize,
        from_flags: FutexFlags,
        to: usize,
        to_flags: FutexFlags,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = to_flags.deadline(timeout, self.system.boot)?;
        let to = self.resolve(to, to_flags)?;
        let from = self.resolve(from, from_flags)?;
        mutex::switch_lock(&from, from_flags, &to, to_flags, deadline)
    }

    pub fn sem_acquire(&self, addr: usize, flags: FutexFlags, timeout: Duration) -> Result<()> {
        let deadline = flags.deadline(timeout, self.system.boot)?;
        let resolved = self.resolve(addr, flags)?;
        semaphore::acquire(&resolved, flags, deadline)
    }

    pub fn sem_release(&self, addr: usize, flags: FutexFlags) -> Result<()> {
        let resolved = self.resolve(addr, flags)?;
        semaphore::release(&resolved)
    }

    /// Interrupt the interruptible waiters blocked on `addr`
    pub fn interrupt(&self, addr: usize, flags: FutexFlags) -> Result<usize> {
        let resolved = self.resolve(addr, flags)?;
        Ok(resolved
            .table
            .lookup(resolved.key, true, None)?
            .map_or(0, |entry| entry.condition.interrupt()))
    }

    /// Number of threads blocked on the word at `addr`
    pub fn waiters(&self, addr: usize, flags: FutexFlags) -> Result<usize> {
        let resolved = self.resolve(addr, flags)?;
        Ok(resolved
            .table
            .lookup(resolved.key, true, None)?
            .map_or(0, |entry| entry.waiter_count()))
    }

    fn resolve(&self, addr: usize, flags: FutexFlags) -> Result<Resolved<'_>> {
        resolve(&self.space, addr, flags, &self.system.shared, || self.private_table())
    }

    fn private_table(&self) -> &Table {
        self.private.call_once(|| {
            log::debug!("futex: creating private context for process {}", self.pid);
            Table::with_capacity(self.system.config.private_table_capacity)
        })
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Some(table) = self.private.get() {
            // Entries are only referenced for the duration of a call.
            debug_assert!(table.is_empty());
            if !table.is_empty() {
                log::warn!("futex: process {} exits with {} live entries", self.pid, table.len());
            }
            log::debug!("futex: deleted private context for process {}", self.pid);
        }
    }
}
