//! NOS Futex - kernel-mediated user mutexes and semaphores
//!
//! User code keeps the fast-path state of a mutex or counting semaphore in
//! an ordinary 32-bit word and enters the kernel only to block a thread that
//! cannot make progress or to wake one that can.
//!
//! # Architecture
//!
//! - **Atomic**: OR/AND/CAS/load on a word, wired (pinned) or through the
//!   fault-safe user accessor
//! - **Table**: per-address entries with reference counting and
//!   re-validated eviction
//! - **Mutex**: lock, unblock (hand-off) and switch-lock
//! - **Semaphore**: counting acquire/release with a `-1` contention sentinel
//! - **System**: private (virtual address) and shared (physical address)
//!   contexts and the public entry points
//! - **User**: the user-level fast paths built on top
//!
//! # Usage
//!
//! ```rust
//! use nos_futex::{FutexFlags, FutexSystem, UserMutex};
//!
//! let system = FutexSystem::new();
//! let process = system.spawn_process();
//! let addr = process.allocate(1)?;
//!
//! let mutex = UserMutex::new(&process, addr, FutexFlags::empty());
//! mutex.lock()?;
//! mutex.unlock()?;
//! # Ok::<(), nos_futex::FutexError>(())
//! ```

pub mod atomic;
pub mod config;
pub mod error;
pub mod flags;
pub mod mm;
pub mod system;
pub mod table;
pub mod user;
pub mod wait_queue;

mod mutex;
mod resolve;
mod semaphore;

pub use config::FutexConfig;
pub use error::{FutexError, Result};
pub use flags::{FutexFlags, MUTEX_DISABLED, MUTEX_LOCKED, MUTEX_WAITING, SEM_CONTENDED};
pub use mm::{AddressSpace, Segment};
pub use system::{FutexSystem, Process};
pub use table::{Entry, EntryRef, Table, TableGuard};
pub use user::{UserMutex, UserSemaphore};
