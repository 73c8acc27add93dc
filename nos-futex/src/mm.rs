//! User memory model for synchronization words
//!
//! Words live in [`Segment`]s: page-granular blocks of 32-bit atomics that
//! carry a simulated physical base. A process sees segments through its
//! [`AddressSpace`], which maps each one at the virtual address of its
//! backing storage. Private allocations are segments mapped into a single
//! address space; shared memory is a segment mapped into several.
//!
//! The address space provides the two collaborator services the futex core
//! consumes:
//!
//! - a fault-safe accessor ([`AddressSpace::with_word`]) that validates every
//!   access against the mapping table and fails with
//!   [`FutexError::BadAddress`] instead of touching invalid memory;
//! - a pin operation ([`AddressSpace::pin`]) that keeps a segment resident for
//!   the duration of one call and yields its stable physical key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use spin::RwLock;

use crate::error::{FutexError, Result};

/// Granularity of simulated physical memory
pub const PAGE_SIZE: usize = 4096;
/// Size of a synchronization word in bytes
pub const WORD_SIZE: usize = std::mem::size_of::<AtomicI32>();

/// A block of word-addressable memory with a stable physical base
#[derive(Debug)]
pub struct Segment {
    phys_base: usize,
    words: Box<[AtomicI32]>,
    pins: AtomicUsize,
}

impl Segment {
    pub(crate) fn new(phys_base: usize, len_words: usize) -> Result<Self> {
        if len_words == 0 {
            return Err(FutexError::InvalidArgument("empty segment"));
        }
        let mut words = Vec::new();
        words
            .try_reserve_exact(len_words)
            .map_err(|_| FutexError::NoMemory)?;
        words.extend((0..len_words).map(|_| AtomicI32::new(0)));
        Ok(Self {
            phys_base,
            words: words.into_boxed_slice(),
            pins: AtomicUsize::new(0),
        })
    }

    /// Virtual address the segment is mapped at
    pub fn base(&self) -> usize {
        self.words.as_ptr() as usize
    }

    /// Simulated physical address of the first word
    pub fn phys_base(&self) -> usize {
        self.phys_base
    }

    /// Number of words in the segment
    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    /// Size of the segment in bytes
    pub fn len_bytes(&self) -> usize {
        self.words.len() * WORD_SIZE
    }

    /// Address of the word at `index`
    pub fn word_address(&self, index: usize) -> Option<usize> {
        (index < self.words.len()).then(|| self.base() + index * WORD_SIZE)
    }

    /// Number of calls currently holding the segment pinned
    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    fn word_at(&self, offset: usize) -> &AtomicI32 {
        &self.words[offset / WORD_SIZE]
    }
}

/// A word whose segment stays resident until the pin is dropped
#[derive(Debug)]
pub struct PinnedWord {
    segment: Arc<Segment>,
    offset: usize,
}

impl PinnedWord {
    fn new(segment: Arc<Segment>, offset: usize) -> Self {
        segment.pins.fetch_add(1, Ordering::AcqRel);
        Self { segment, offset }
    }

    /// System-wide key of the word
    pub fn physical_address(&self) -> usize {
        self.segment.phys_base + self.offset
    }

    pub fn word(&self) -> &AtomicI32 {
        self.segment.word_at(self.offset)
    }
}

impl Drop for PinnedWord {
    fn drop(&mut self) {
        self.segment.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct Mapping {
    segment: Arc<Segment>,
    writable: bool,
}

/// Per-process view of user memory
#[derive(Debug, Default)]
pub struct AddressSpace {
    mappings: RwLock<BTreeMap<usize, Mapping>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `segment` and return the virtual address of its first word
    pub fn map(&self, segment: Arc<Segment>, writable: bool) -> Result<usize> {
        let base = segment.base();
        let mut mappings = self.mappings.write();
        if mappings.contains_key(&base) {
            return Err(FutexError::InvalidArgument("segment already mapped"));
        }
        mappings.insert(base, Mapping { segment, writable });
        Ok(base)
    }

    /// Remove the mapping starting at `base`
    pub fn unmap(&self, base: usize) -> Result<Arc<Segment>> {
        self.mappings
            .write()
            .remove(&base)
            .map(|mapping| mapping.segment)
            .ok_or(FutexError::InvalidArgument("no mapping at address"))
    }

    /// Number of live mappings
    pub fn mapping_count(&self) -> usize {
        self.mappings.read().len()
    }

    /// Run `f` on the word at `addr` if it is a valid user word.
    ///
    /// The mapping table stays read-locked while `f` runs, so the word
    /// cannot be unmapped underneath the access.
    pub fn with_word<R>(&self, addr: usize, write: bool, f: impl FnOnce(&AtomicI32) -> R) -> Result<R> {
        let mappings = self.mappings.read();
        let (mapping, offset) = locate(&mappings, addr)?;
        if write && !mapping.writable {
            return Err(FutexError::BadAddress);
        }
        Ok(f(mapping.segment.word_at(offset)))
    }

    /// Validate that `addr` names a writable user word
    pub fn check_word(&self, addr: usize) -> Result<()> {
        self.with_word(addr, true, |_| ())
    }

    /// Pin the page backing `addr` for the duration of one call
    pub fn pin(&self, addr: usize) -> Result<PinnedWord> {
        let mappings = self.mappings.read();
        let (mapping, offset) = locate(&mappings, addr)?;
        if !mapping.writable {
            return Err(FutexError::BadAddress);
        }
        Ok(PinnedWord::new(mapping.segment.clone(), offset))
    }
}

fn locate(mappings: &BTreeMap<usize, Mapping>, addr: usize) -> Result<(&Mapping, usize)> {
    if addr == 0 || addr % WORD_SIZE != 0 {
        return Err(FutexError::BadAddress);
    }
    let (base, mapping) = mappings
        .range(..=addr)
        .next_back()
        .ok_or(FutexError::BadAddress)?;
    let offset = addr - base;
    if offset + WORD_SIZE > mapping.segment.len_bytes() {
        return Err(FutexError::BadAddress);
    }
    Ok((mapping, offset))
}
