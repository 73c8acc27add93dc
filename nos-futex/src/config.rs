//! Futex subsystem configuration

/// Sizing knobs for the futex contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FutexConfig {
    /// Initial entry capacity of each per-process table
    pub private_table_capacity: usize,
    /// Initial entry capacity of the global shared table
    pub shared_table_capacity: usize,
}

impl Default for FutexConfig {
    fn default() -> Self {
        Self {
            private_table_capacity: 16,
            shared_table_capacity: 64,
        }
    }
}
