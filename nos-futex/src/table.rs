//! Futex entries and the address-keyed tables that own them
//!
//! An [`Entry`] is the kernel-side object bound to one synchronization word:
//! a reference count, a read-write lock serializing its waiter metadata, and
//! the wait queue itself. A [`Table`] maps addresses (virtual for a private
//! context, physical for the shared one) to entries.
//!
//! Entries are created lazily on lookup and evicted when the last reference
//! is released. Eviction re-validates under the table's write lock that the
//! entry is still the registered one and that its count is still zero, so a
//! lookup racing with the final release always keeps the entry alive.

use std::sync::Arc;
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, Ordering};

use hashbrown::HashMap;
use spin::{RwLock, RwLockUpgradableGuard};

use crate::error::{FutexError, Result};
use crate::wait_queue::WaitQueue;

/// Kernel-side state of one synchronization word
#[derive(Debug)]
pub struct Entry {
    address: usize,
    ref_count: AtomicI32,
    /// Readers may enqueue; writers wake and adjust flag bits
    pub(crate) lock: RwLock<()>,
    pub(crate) condition: WaitQueue,
}

impl Entry {
    fn new(address: usize) -> Self {
        Self {
            address,
            ref_count: AtomicI32::new(1),
            lock: RwLock::new(()),
            condition: WaitQueue::new(),
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Number of threads queued on this entry
    pub fn waiter_count(&self) -> usize {
        self.condition.count()
    }
}

type EntryMap = HashMap<usize, Arc<Entry>>;

/// Upgradeable read lock on a [`Table`], for lookups made while already
/// holding it.
///
/// While the guard is held, new readers and writers of the table wait. That
/// includes the eviction run by a last [`EntryRef`] drop.
#[derive(Debug)]
pub struct TableGuard<'t> {
    table: &'t Table,
    // Only `None` while an insertion has the lock upgraded.
    entries: Option<RwLockUpgradableGuard<'t, EntryMap>>,
}

/// Address to entry map of one futex context
#[derive(Debug)]
pub struct Table {
    entries: RwLock<EntryMap>,
}

impl Table {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Take the table's lock in upgradeable read mode
    pub fn upgradeable_read(&self) -> TableGuard<'_> {
        TableGuard {
            table: self,
            entries: Some(self.entries.upgradeable_read()),
        }
    }

    /// Find the entry for `address` and take a reference to it.
    ///
    /// When absent and `no_insert` is false, a fresh entry is inserted under
    /// the write lock after re-checking for a concurrent insertion. `held`
    /// is the caller's guard on this table, if it already holds one: a miss
    /// then upgrades it for the insertion and downgrades it again, so the
    /// caller still holds it afterwards. References taken under a held guard
    /// must outlive it: dropping the last one needs the write lock.
    pub fn lookup<'t>(
        &'t self,
        address: usize,
        no_insert: bool,
        held: Option<&mut TableGuard<'t>>,
    ) -> Result<Option<EntryRef<'t>>> {
        match held {
            Some(guard) => self.lookup_held(address, no_insert, guard),
            None => self.lookup_unlocked(address, no_insert),
        }
    }

    fn lookup_unlocked(&self, address: usize, no_insert: bool) -> Result<Option<EntryRef<'_>>> {
        {
            let entries = self.entries.read();
            if let Some(entry) = self.acquire(&entries, address) {
                return Ok(Some(entry));
            }
        }
        if no_insert {
            return Ok(None);
        }
        let mut entries = self.entries.write();
        self.insert(&mut entries, address).map(Some)
    }

    fn lookup_held<'t>(
        &'t self,
        address: usize,
        no_insert: bool,
        guard: &mut TableGuard<'t>,
    ) -> Result<Option<EntryRef<'t>>> {
        if !std::ptr::eq(guard.table, self) {
            return Err(FutexError::InvalidArgument("guard belongs to another table"));
        }
        if let Some(entry) = guard
            .entries
            .as_deref()
            .and_then(|entries| self.acquire(entries, address))
        {
            return Ok(Some(entry));
        }
        if no_insert {
            return Ok(None);
        }

        let upgradeable = guard
            .entries
            .take()
            .ok_or(FutexError::InvalidState("table guard not held"))?;
        let mut entries = upgradeable.upgrade();
        let result = self.insert(&mut entries, address);
        guard.entries = Some(entries.downgrade_to_upgradeable());
        result.map(Some)
    }

    // Caller holds the write lock.
    fn insert(&self, entries: &mut EntryMap, address: usize) -> Result<EntryRef<'_>> {
        if let Some(entry) = self.acquire(entries, address) {
            return Ok(entry);
        }
        entries.try_reserve(1).map_err(|_| FutexError::NoMemory)?;
        let entry = Arc::new(Entry::new(address));
        entries.insert(address, entry.clone());
        log::trace!("futex: created entry for {:#x}", address);
        Ok(EntryRef { table: self, entry })
    }

    /// Find the entry for `address`, creating it if needed
    pub fn get_or_create(&self, address: usize) -> Result<EntryRef<'_>> {
        self.lookup(address, false, None)?
            .ok_or(FutexError::InvalidState("insertion produced no entry"))
    }

    /// Drop a reference obtained from [`Table::lookup`]; `None` is a no-op.
    pub fn release(&self, entry: Option<EntryRef<'_>>) {
        drop(entry);
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn acquire(&self, entries: &EntryMap, address: usize) -> Option<EntryRef<'_>> {
        entries.get(&address).map(|entry| {
            entry.ref_count.fetch_add(1, Ordering::AcqRel);
            EntryRef {
                table: self,
                entry: entry.clone(),
            }
        })
    }

    fn release_entry(&self, entry: &Arc<Entry>) {
        if entry.ref_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let mut entries = self.entries.write();
        let registered = entries
            .get(&entry.address)
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        // A lookup may have revived the entry before we got the write lock.
        if registered && entry.ref_count.load(Ordering::Acquire) == 0 {
            entries.remove(&entry.address);
            log::trace!("futex: evicted entry for {:#x}", entry.address);
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

/// Counted reference to an [`Entry`]; released on drop
#[derive(Debug)]
pub struct EntryRef<'t> {
    table: &'t Table,
    entry: Arc<Entry>,
}

impl EntryRef<'_> {
    /// Whether both references name the same entry
    pub fn same_entry(&self, other: &EntryRef<'_>) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl Deref for EntryRef<'_> {
    type Target = Entry;

    fn deref(&self) -> &Entry {
        &self.entry
    }
}

impl Drop for EntryRef<'_> {
    fn drop(&mut self) {
        self.table.release_entry(&self.entry);
    }
}
