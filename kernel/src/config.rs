//! Kernel configuration
//!
//! Sizes of the two resources the model kernel hands out: process slots and
//! physical pages. Both default to generous values; tests shrink them to
//! provoke exhaustion.

use libexo::NENV;

/// Resource limits for one kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Usable process slots, at most [`NENV`].
    pub max_envs: usize,
    /// Physical pages available, counting page directories and page tables.
    pub max_frames: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_envs: NENV,
            max_frames: 16 * 1024,
        }
    }
}

impl KernelConfig {
    pub fn max_envs(mut self, n: usize) -> Self {
        self.max_envs = n.min(NENV);
        self
    }

    pub fn max_frames(mut self, n: usize) -> Self {
        self.max_frames = n;
        self
    }
}
