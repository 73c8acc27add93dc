//! Address resolution: pick the context and key for a word

use crate::atomic::{AtomicWord, UserWord, WiredWord};
use crate::error::Result;
use crate::flags::FutexFlags;
use crate::mm::AddressSpace;
use crate::table::Table;

enum WordAccess<'p> {
    Wired(WiredWord),
    User(UserWord<'p>),
}

/// A word bound to its context for the duration of one call
pub(crate) struct Resolved<'p> {
    pub table: &'p Table,
    pub key: usize,
    access: WordAccess<'p>,
}

impl Resolved<'_> {
    pub fn word(&self) -> &dyn AtomicWord {
        match &self.access {
            WordAccess::Wired(word) => word,
            WordAccess::User(word) => word,
        }
    }
}

/// Resolve `addr` in `space`.
///
/// Shared words are pinned and keyed by physical address in `shared`;
/// private words are validated and keyed by virtual address in the table
/// produced by `private`, which is only created when actually needed.
pub(crate) fn resolve<'p>(
    space: &'p AddressSpace,
    addr: usize,
    flags: FutexFlags,
    shared: &'p Table,
    private: impl FnOnce() -> &'p Table,
) -> Result<Resolved<'p>> {
    if flags.is_shared() {
        let word = WiredWord::new(space.pin(addr)?);
        return Ok(Resolved {
            table: shared,
            key: word.physical_address(),
            access: WordAccess::Wired(word),
        });
    }
    space.check_word(addr)?;
    Ok(Resolved {
        table: private(),
        key: addr,
        access: WordAccess::User(UserWord::new(space, addr)),
    })
}
