//! Host model of the exokernel beneath `libexo`.
//!
//! The kernel exports page-granular memory primitives, process creation and
//! page-fault upcalls, with the argument checks a real exokernel performs.
//! Physical memory is a pool of reference-counted 4 KiB pages; each process
//! owns a two-level page table over it. User loads and stores go through
//! [`Process::read`] and [`Process::write`], which fault exactly where the
//! hardware would and deliver the fault to the process's upcall.
//!
//! All state sits behind one lock. The lock is never held while user code
//! (an upcall) runs.

pub mod config;
pub mod memory;
pub mod process;
pub mod stats;
pub mod syscall;

use std::sync::Arc;

use libexo::errno::Errno;
use libexo::{EnvId, EnvStatus};
use spin::Mutex;
use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

pub use config::KernelConfig;
pub use memory::Pte;
pub use process::{AccessError, EnvInfo, KillCause, Process};
pub use stats::KernelStats;

use memory::FrameTable;
use process::env::EnvTable;
use stats::Counters;

/// Everything the kernel lock protects.
pub(crate) struct KernelState {
    pub envs: EnvTable,
    pub frames: FrameTable,
}

impl KernelState {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            envs: EnvTable::new(config.max_envs),
            frames: FrameTable::new(config.max_frames),
        }
    }

    /// Create a runnable process with no parent.
    pub fn create_root(&mut self) -> Result<EnvId, Errno> {
        let slot = self.envs.free_slot().ok_or(Errno::ENOFREEENV)?;
        let space = memory::AddressSpace::new(&mut self.frames)?;
        Ok(self.envs.insert(slot, EnvId::SELF, EnvStatus::Runnable, space))
    }

    /// Free `id` and every page it maps.
    pub fn destroy(&mut self, id: EnvId) -> bool {
        match self.envs.remove(id) {
            Some(env) => {
                env.space.teardown(&mut self.frames);
                true
            }
            None => false,
        }
    }
}

struct Inner {
    config: KernelConfig,
    state: Mutex<KernelState>,
    counters: Counters,
}

/// One kernel instance. Cloning yields another handle to the same kernel.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<Inner>,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        log::info!(
            "exokernel up: {} env slots, {} pages",
            config.max_envs,
            config.max_frames
        );
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(KernelState::new(config)),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> KernelConfig {
        self.inner.config
    }

    /// Start a fresh, empty, runnable process.
    pub fn spawn(&self) -> Result<Process, Errno> {
        let id = self.with_state(KernelState::create_root)?;
        Counters::bump(&self.inner.counters.envs_created);
        log::info!("spawned env {}", id);
        Ok(Process::new(self.clone(), id))
    }

    /// Handle for `id`, as the scheduler would run it. Only runnable
    /// processes can be run.
    pub fn process(&self, id: EnvId) -> Option<Process> {
        match self.env_info(id)?.status {
            EnvStatus::Runnable => Some(Process::new(self.clone(), id)),
            _ => None,
        }
    }

    /// Destroy `id`, releasing its memory. Returns whether it existed.
    pub fn destroy(&self, id: EnvId) -> bool {
        let destroyed = self.with_state(|st| st.destroy(id));
        if destroyed {
            log::info!("env {} destroyed", id);
        }
        destroyed
    }

    pub fn env_info(&self, id: EnvId) -> Option<EnvInfo> {
        self.with_state(|st| st.envs.get(id).map(|env| env.info()))
    }

    /// Every live process, in slot order.
    pub fn envs(&self) -> Vec<EnvInfo> {
        self.with_state(|st| st.envs.iter().map(|env| env.info()).collect())
    }

    /// The mapping at `va` in `env`, if any.
    pub fn mapping(&self, env: EnvId, va: VirtAddr) -> Option<Pte> {
        self.with_state(|st| st.envs.get(env).and_then(|e| e.space.lookup(va)))
    }

    pub fn frame_refcount(&self, frame: PhysFrame) -> u32 {
        self.with_state(|st| st.frames.refcount(frame))
    }

    pub fn frames_in_use(&self) -> usize {
        self.with_state(|st| st.frames.in_use())
    }

    /// Change the page budget. Pages already allocated stay allocated.
    pub fn limit_frames(&self, max: usize) {
        log::debug!("page budget now {}", max);
        self.with_state(|st| st.frames.set_budget(max));
    }

    pub fn stats(&self) -> KernelStats {
        self.inner.counters.snapshot()
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let mut state = self.inner.state.lock();
        f(&mut *state)
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.inner.counters
    }

    /// Destroy `id` for an undeliverable or unresolved fault at `va`.
    pub(crate) fn kill(&self, id: EnvId, va: VirtAddr, cause: KillCause) -> AccessError {
        if self.with_state(|st| st.destroy(id)) {
            Counters::bump(&self.inner.counters.envs_killed);
            log::warn!("[{}] killed: {} at {:#x}", id, cause, va.as_u64());
        }
        AccessError::Killed { env: id, va, cause }
    }
}
