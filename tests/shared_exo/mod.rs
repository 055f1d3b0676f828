//! Helpers shared by the integration suites: boot a kernel, give the root
//! process some memory, and run a forked child the way the scheduler would.

#![allow(dead_code)]

use exokern::{Kernel, KernelConfig, Process};
use libexo::memlayout::{PGSIZE, UTEXT};
use libexo::{EnvId, ForkResult, PteFlags, Runtime, Syscalls, PERM_RW};
use x86_64::VirtAddr;

/// First data page of every test program.
pub const DATA: VirtAddr = VirtAddr::new(UTEXT);

/// Protection of a plain read-only user page.
pub const READ_ONLY: PteFlags = PteFlags::PRESENT.union(PteFlags::USER_ACCESSIBLE);

pub fn page(n: u64) -> VirtAddr {
    DATA + n * PGSIZE
}

pub struct World {
    pub kernel: Kernel,
    pub parent: Runtime<Process>,
}

impl World {
    pub fn boot() -> Self {
        Self::boot_with(KernelConfig::default())
    }

    pub fn boot_with(config: KernelConfig) -> Self {
        let kernel = Kernel::new(config);
        let root = kernel.spawn().expect("spawn root process");
        World {
            parent: Runtime::bootstrap(root),
            kernel,
        }
    }

    pub fn root(&self) -> &Process {
        self.parent.sys()
    }

    /// Fork the root and return the child's runtime, already resumed
    /// inside its fork call.
    pub fn fork_child(&mut self) -> Runtime<Process> {
        let child = match self.parent.fork().expect("fork") {
            ForkResult::Parent(child) => child,
            ForkResult::Child => panic!("root resumed as a child"),
        };
        resume(&self.kernel, &self.parent, child)
    }
}

/// Schedule `child` for the first time: its runtime is the parent's copy
/// and its first fork call returns in the child.
pub fn resume(kernel: &Kernel, parent: &Runtime<Process>, child: EnvId) -> Runtime<Process> {
    let handle = kernel.process(child).expect("child is runnable");
    let mut rt = parent.duplicate_for(handle);
    assert_eq!(rt.fork(), Ok(ForkResult::Child));
    assert_eq!(rt.thisenv(), child);
    rt
}

/// Map a fresh writable page at `va` holding `bytes`.
pub fn map_rw(p: &Process, va: VirtAddr, bytes: &[u8]) {
    p.page_alloc(EnvId::SELF, va, PERM_RW).expect("page_alloc");
    p.write(va, bytes).expect("initial write");
}

/// Map a page holding `bytes` with protection `perm` (no write access).
pub fn map_with(p: &Process, va: VirtAddr, bytes: &[u8], perm: PteFlags) {
    map_rw(p, va, bytes);
    p.page_map(EnvId::SELF, va, EnvId::SELF, va, perm)
        .expect("downgrade mapping");
}

pub fn read(p: &Process, va: VirtAddr, len: usize) -> Vec<u8> {
    p.read(va, len).expect("read")
}
