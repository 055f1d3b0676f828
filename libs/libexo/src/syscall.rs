//! Kernel primitives consumed by the library.
//!
//! The exokernel exports a handful of page-granular operations. Each one
//! takes an explicit target process; [`EnvId::SELF`] names the caller.
//! A process may only operate on itself and its immediate children.

use x86_64::VirtAddr;

use crate::error::Error;
use crate::mmu::PteFlags;
use crate::pgfault::UTrapframe;
use crate::types::{EnvId, EnvStatus};
use crate::uvpt::Vpt;

/// Page-fault entry point registered with the kernel.
///
/// The kernel invokes it on the faulting process's exception stack, with a
/// handle through which that process issues further primitives. Returning
/// resumes the faulting instruction; panicking terminates the process.
pub type Upcall<S> = fn(&S, &UTrapframe);

/// Both outcomes of a process-creation call.
///
/// The call returns twice: once in the caller with the new identifier, and
/// once in the child, which resumes from the same point with its address
/// space populated to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exofork {
    /// Returned in the new process.
    Child,
    /// Returned in the creating process.
    Parent(EnvId),
}

/// Privileged operations the kernel performs on the library's behalf.
pub trait Syscalls {
    /// Identifier of the calling process.
    fn getenvid(&self) -> EnvId;

    /// Create a blank, not-yet-runnable child whose registers match the
    /// caller's at the point of the call.
    fn exofork(&self) -> Result<Exofork, Error>;

    /// Map a fresh zero-filled page at `va` in `env`, replacing whatever was
    /// there. `perm` must include present and user and lie within
    /// [`PTE_SYSCALL`](crate::mmu::PTE_SYSCALL).
    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PteFlags) -> Result<(), Error>;

    /// Map the physical page behind `src_va` in `src_env` at `dst_va` in
    /// `dst_env`, replacing whatever was there. Asking for the writable bit
    /// on a page the source maps read-only is refused.
    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> Result<(), Error>;

    /// Remove the mapping at `va` in `env`, if any.
    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> Result<(), Error>;

    /// Register the page-fault entry point for `env`.
    fn env_set_pgfault_upcall(&self, env: EnvId, upcall: Upcall<Self>) -> Result<(), Error>
    where
        Self: Sized;

    /// Set `env` runnable or not runnable.
    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<(), Error>;
}

/// Ordinary loads and stores in the caller's own address space.
pub trait UserMemory {
    /// Copy one whole page from `src` to `dst`. Both must be page aligned;
    /// `dst` must be writable. Faults the same way a `memmove` would.
    fn copy_page(&self, dst: VirtAddr, src: VirtAddr);
}

/// Everything the library needs from the process it is linked into.
pub trait Platform: Syscalls + Vpt + UserMemory + Sized {}

impl<T: Syscalls + Vpt + UserMemory> Platform for T {}
