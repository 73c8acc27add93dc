//! Atomic access to synchronization words
//!
//! Two flavours: [`WiredWord`] operates directly on a pinned word, while
//! [`UserWord`] goes through the fault-safe user accessor and reports
//! [`FutexError::BadAddress`](crate::error::FutexError::BadAddress) when the
//! word is not a mapped, writable location. All operations are sequentially
//! consistent.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::Result;
use crate::mm::{AddressSpace, PinnedWord};

/// Serializing operations on one 32-bit word
pub trait AtomicWord {
    /// Bitwise OR, returns the previous value
    fn or(&self, mask: i32) -> Result<i32>;
    /// Bitwise AND, returns the previous value
    fn and(&self, mask: i32) -> Result<i32>;
    /// Store `new` if the word equals `expected`; returns the previous value
    fn cas(&self, new: i32, expected: i32) -> Result<i32>;
    fn get(&self) -> Result<i32>;
}

fn cas_raw(word: &AtomicI32, new: i32, expected: i32) -> i32 {
    match word.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(old) | Err(old) => old,
    }
}

/// Word whose page is pinned for the duration of the call
pub struct WiredWord {
    pin: PinnedWord,
}

impl WiredWord {
    pub fn new(pin: PinnedWord) -> Self {
        Self { pin }
    }

    pub fn physical_address(&self) -> usize {
        self.pin.physical_address()
    }
}

impl AtomicWord for WiredWord {
    fn or(&self, mask: i32) -> Result<i32> {
        Ok(self.pin.word().fetch_or(mask, Ordering::SeqCst))
    }

    fn and(&self, mask: i32) -> Result<i32> {
        Ok(self.pin.word().fetch_and(mask, Ordering::SeqCst))
    }

    fn cas(&self, new: i32, expected: i32) -> Result<i32> {
        Ok(cas_raw(self.pin.word(), new, expected))
    }

    fn get(&self) -> Result<i32> {
        Ok(self.pin.word().load(Ordering::SeqCst))
    }
}

/// Word reached through the caller's address space
pub struct UserWord<'a> {
    space: &'a AddressSpace,
    addr: usize,
}

impl<'a> UserWord<'a> {
    pub fn new(space: &'a AddressSpace, addr: usize) -> Self {
        Self { space, addr }
    }
}

impl AtomicWord for UserWord<'_> {
    fn or(&self, mask: i32) -> Result<i32> {
        self.space
            .with_word(self.addr, true, |w| w.fetch_or(mask, Ordering::SeqCst))
    }

    fn and(&self, mask: i32) -> Result<i32> {
        self.space
            .with_word(self.addr, true, |w| w.fetch_and(mask, Ordering::SeqCst))
    }

    fn cas(&self, new: i32, expected: i32) -> Result<i32> {
        self.space
            .with_word(self.addr, true, |w| cas_raw(w, new, expected))
    }

    fn get(&self) -> Result<i32> {
        self.space
            .with_word(self.addr, false, |w| w.load(Ordering::SeqCst))
    }
}
