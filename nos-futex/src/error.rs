//! Error handling module for the futex core

use std::fmt;

/// Errors surfaced by the futex entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexError {
    /// Word pointer is misaligned, unmapped or not writable
    BadAddress,
    /// Entry or table node could not be allocated
    NoMemory,
    /// The wait deadline passed before the thread was woken
    TimedOut,
    /// The wait was interrupted
    Interrupted,
    /// Malformed argument (conflicting flags, unknown mapping, ...)
    InvalidArgument(&'static str),
    /// Word holds a value the protocol does not define
    InvalidState(&'static str),
}

impl FutexError {
    /// Negative POSIX-style error number for syscall layers
    pub fn errno(&self) -> i32 {
        match self {
            FutexError::BadAddress => -14,
            FutexError::NoMemory => -12,
            FutexError::TimedOut => -110,
            FutexError::Interrupted => -4,
            FutexError::InvalidArgument(_) => -22,
            FutexError::InvalidState(_) => -22,
        }
    }

    /// Whether the error is an outcome of the wait primitive
    pub fn is_wait_outcome(&self) -> bool {
        matches!(self, FutexError::TimedOut | FutexError::Interrupted)
    }
}

impl fmt::Display for FutexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FutexError::BadAddress => write!(f, "Bad address"),
            FutexError::NoMemory => write!(f, "Out of memory"),
            FutexError::TimedOut => write!(f, "Operation timed out"),
            FutexError::Interrupted => write!(f, "Interrupted"),
            FutexError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            FutexError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for FutexError {}

/// Result type for futex operations
pub type Result<T> = std::result::Result<T, FutexError>;
