//! Kernel event counters
//!
//! Updated lock-free from the syscall and fault paths and read back by
//! tests and the demo as a [`KernelStats`] snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    /// Page faults handed to a user upcall
    pub faults_delivered: AtomicU64,
    /// Upcalls that returned normally
    pub upcalls_completed: AtomicU64,
    pub envs_created: AtomicU64,
    /// Processes destroyed because of an unhandled fault
    pub envs_killed: AtomicU64,
    /// Successful page_alloc and page_map calls
    pub pages_mapped: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> KernelStats {
        KernelStats {
            faults_delivered: self.faults_delivered.load(Ordering::Relaxed),
            upcalls_completed: self.upcalls_completed.load(Ordering::Relaxed),
            envs_created: self.envs_created.load(Ordering::Relaxed),
            envs_killed: self.envs_killed.load(Ordering::Relaxed),
            pages_mapped: self.pages_mapped.load(Ordering::Relaxed),
        }
    }
}

/// Kernel statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    pub faults_delivered: u64,
    pub upcalls_completed: u64,
    pub envs_created: u64,
    pub envs_killed: u64,
    pub pages_mapped: u64,
}

impl core::fmt::Display for KernelStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "faults={} upcalls={} created={} killed={} mapped={}",
            self.faults_delivered,
            self.upcalls_completed,
            self.envs_created,
            self.envs_killed,
            self.pages_mapped
        )
    }
}
