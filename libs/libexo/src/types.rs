//! Common types used across libexo

use core::fmt;

/// log2 of the process table size.
pub const LOG2NENV: u32 = 10;
/// Number of slots in the kernel's process table.
pub const NENV: usize = 1 << LOG2NENV;

/// Process (environment) identifier.
///
/// Identifiers are `generation | slot`. The generation changes every time a
/// slot is reused, so a stale identifier never names a newer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct EnvId(i32);

impl EnvId {
    /// Names the calling process in every kernel primitive.
    pub const SELF: EnvId = EnvId(0);

    pub const fn from_raw(raw: i32) -> Self {
        EnvId(raw)
    }
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Slot of this identifier in the process table.
    pub const fn envx(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }

    pub const fn is_self(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Scheduling status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    /// Slot unused.
    Free,
    /// Being torn down.
    Dying,
    /// Ready to be scheduled.
    Runnable,
    /// Currently executing.
    Running,
    /// Exists but must not be scheduled, e.g. a child still being set up.
    NotRunnable,
}
