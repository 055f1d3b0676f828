//! Running processes
//!
//! A [`Process`] is the handle a user program runs through: every kernel
//! primitive it issues, every look at its own page tables and every load
//! and store goes through here. Loads and stores are checked against the
//! page tables; a violating access raises a page fault that is delivered
//! to the process's registered upcall, the way the trap path of a real
//! kernel would.

pub mod env;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use libexo::errno::Errno;
use libexo::memlayout::{pdx, uxstack_page, PGSIZE};
use libexo::{
    EnvId, EnvStatus, Error, Exofork, PteFlags, Syscalls, UTrapframe, Upcall,
    UserMemory, Vpt, PERM_RW,
};
use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::VirtAddr;

use crate::stats::Counters;
use crate::Kernel;

pub use env::EnvInfo;

/// Why the kernel destroyed a process after a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillCause {
    /// No fault upcall registered.
    NoUpcall,
    /// The exception stack is not mapped writable.
    NoExceptionStack,
    /// The process faulted while its upcall was running.
    NestedFault,
    /// The upcall aborted.
    HandlerPanicked,
    /// The access still faulted after the upcall returned.
    Unresolved,
}

impl fmt::Display for KillCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KillCause::NoUpcall => "no page fault upcall",
            KillCause::NoExceptionStack => "exception stack not mapped",
            KillCause::NestedFault => "fault inside the fault handler",
            KillCause::HandlerPanicked => "page fault handler aborted",
            KillCause::Unresolved => "fault not resolved by handler",
        })
    }
}

/// Outcome of a user load or store that did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// The process no longer exists.
    Dead(EnvId),
    /// The access faulted and the process was destroyed.
    Killed {
        env: EnvId,
        va: VirtAddr,
        cause: KillCause,
    },
}

impl AccessError {
    pub fn is_killed(&self) -> bool {
        matches!(self, AccessError::Killed { .. })
    }
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessError::Dead(env) => write!(f, "env {} does not exist", env),
            AccessError::Killed { env, va, cause } => {
                write!(f, "env {} killed at {:#x}: {}", env, va.as_u64(), cause)
            }
        }
    }
}

impl std::error::Error for AccessError {}

/// What the kernel decided to do with a page fault.
enum Delivery {
    Run(Upcall<Process>, UTrapframe),
    Refuse(KillCause),
}

/// Handle of one process, as the code running inside it sees the kernel.
#[derive(Clone)]
pub struct Process {
    kernel: Kernel,
    id: EnvId,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process").field("id", &self.id).finish()
    }
}

impl Process {
    pub(crate) fn new(kernel: Kernel, id: EnvId) -> Self {
        Self { kernel, id }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn is_alive(&self) -> bool {
        self.kernel.env_info(self.id).is_some()
    }

    /// Load `len` bytes starting at `va`.
    pub fn read(&self, va: VirtAddr, len: usize) -> Result<Vec<u8>, AccessError> {
        let mut out = Vec::with_capacity(len);
        let mut addr = va;
        while out.len() < len {
            let offset = (addr.as_u64() % PGSIZE) as usize;
            let n = (PGSIZE as usize - offset).min(len - out.len());
            self.access(addr, false, &mut |page: &mut [u8]| {
                out.extend_from_slice(&page[offset..offset + n])
            })?;
            addr += n as u64;
        }
        Ok(out)
    }

    /// Store `bytes` starting at `va`.
    pub fn write(&self, va: VirtAddr, bytes: &[u8]) -> Result<(), AccessError> {
        let mut done = 0;
        let mut addr = va;
        while done < bytes.len() {
            let offset = (addr.as_u64() % PGSIZE) as usize;
            let n = (PGSIZE as usize - offset).min(bytes.len() - done);
            let chunk = &bytes[done..done + n];
            self.access(addr, true, &mut |page: &mut [u8]| {
                page[offset..offset + n].copy_from_slice(chunk)
            })?;
            done += n;
            addr += n as u64;
        }
        Ok(())
    }

    /// Perform one access within a single page, faulting at most once.
    fn access(
        &self,
        va: VirtAddr,
        write: bool,
        op: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), AccessError> {
        if self.probe(va, write, op)? {
            return Ok(());
        }
        self.deliver_fault(va, write)?;
        if self.probe(va, write, op)? {
            return Ok(());
        }
        Err(self.kernel.kill(self.id, va, KillCause::Unresolved))
    }

    /// Run `op` on the page behind `va` if the access is permitted.
    fn probe(
        &self,
        va: VirtAddr,
        write: bool,
        op: &mut dyn FnMut(&mut [u8]),
    ) -> Result<bool, AccessError> {
        let id = self.id;
        self.kernel.with_state(|st| {
            let env = st.envs.get(id).ok_or(AccessError::Dead(id))?;
            let Some(pte) = env.space.lookup(va.align_down(PGSIZE)) else {
                return Ok(false);
            };
            let mut needed = PteFlags::PRESENT | PteFlags::USER_ACCESSIBLE;
            if write {
                needed |= PteFlags::WRITABLE;
            }
            if !pte.flags.contains(needed) {
                return Ok(false);
            }
            match st.frames.data_mut(pte.frame) {
                Some(data) => {
                    op(&mut data[..]);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn deliver_fault(&self, va: VirtAddr, write: bool) -> Result<(), AccessError> {
        let id = self.id;
        let delivery = self.kernel.with_state(|st| {
            let env = st.envs.get_mut(id)?;
            if env.in_upcall {
                return Some(Delivery::Refuse(KillCause::NestedFault));
            }
            let Some(upcall) = env.upcall else {
                return Some(Delivery::Refuse(KillCause::NoUpcall));
            };
            let xstack_ok = env
                .space
                .lookup(uxstack_page())
                .map_or(false, |pte| pte.flags.contains(PERM_RW));
            if !xstack_ok {
                return Some(Delivery::Refuse(KillCause::NoExceptionStack));
            }

            let mut err = PageFaultErrorCode::USER_MODE;
            if write {
                err |= PageFaultErrorCode::CAUSED_BY_WRITE;
            }
            if env.space.lookup(va.align_down(PGSIZE)).is_some() {
                err |= PageFaultErrorCode::PROTECTION_VIOLATION;
            }
            env.in_upcall = true;
            Some(Delivery::Run(upcall, UTrapframe::new(va, err)))
        });

        let (upcall, utf) = match delivery {
            None => return Err(AccessError::Dead(id)),
            Some(Delivery::Refuse(cause)) => return Err(self.kernel.kill(id, va, cause)),
            Some(Delivery::Run(upcall, utf)) => (upcall, utf),
        };

        Counters::bump(&self.kernel.counters().faults_delivered);
        log::debug!(
            "[{}] page fault at {:#x} (err {:?}), running upcall",
            id,
            va.as_u64(),
            utf.err
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| upcall(self, &utf)));

        let alive = self.kernel.with_state(|st| match st.envs.get_mut(id) {
            Some(env) => {
                env.in_upcall = false;
                true
            }
            None => false,
        });
        if !alive {
            // Only a fault taken inside the upcall destroys a process
            // while its upcall is running.
            return Err(AccessError::Killed {
                env: id,
                va,
                cause: KillCause::NestedFault,
            });
        }
        match outcome {
            Ok(()) => {
                Counters::bump(&self.kernel.counters().upcalls_completed);
                Ok(())
            }
            Err(_) => Err(self.kernel.kill(id, va, KillCause::HandlerPanicked)),
        }
    }

    fn call<T>(&self, f: impl FnOnce(&mut crate::KernelState) -> Result<T, Errno>) -> Result<T, Error> {
        self.kernel.with_state(f).map_err(Error::from)
    }
}

impl Syscalls for Process {
    fn getenvid(&self) -> EnvId {
        self.id
    }

    fn exofork(&self) -> Result<Exofork, Error> {
        let result = self.call(|st| st.sys_exofork(self.id))?;
        if let Exofork::Parent(_) = result {
            Counters::bump(&self.kernel.counters().envs_created);
        }
        Ok(result)
    }

    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PteFlags) -> Result<(), Error> {
        self.call(|st| st.sys_page_alloc(self.id, env, va, perm))?;
        Counters::bump(&self.kernel.counters().pages_mapped);
        Ok(())
    }

    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> Result<(), Error> {
        self.call(|st| st.sys_page_map(self.id, src_env, src_va, dst_env, dst_va, perm))?;
        Counters::bump(&self.kernel.counters().pages_mapped);
        Ok(())
    }

    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> Result<(), Error> {
        self.call(|st| st.sys_page_unmap(self.id, env, va))
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, upcall: Upcall<Self>) -> Result<(), Error> {
        self.call(|st| st.sys_env_set_pgfault_upcall(self.id, env, upcall))
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<(), Error> {
        self.call(|st| st.sys_env_set_status(self.id, env, status))
    }
}

impl Vpt for Process {
    fn uvpd(&self, dir: usize) -> PteFlags {
        self.kernel.with_state(|st| {
            st.envs
                .get(self.id)
                .map_or(PteFlags::empty(), |env| env.space.pde_flags(dir))
        })
    }

    fn uvpt(&self, pn: usize) -> PteFlags {
        self.kernel.with_state(|st| {
            st.envs
                .get(self.id)
                .map_or(PteFlags::empty(), |env| env.space.pte_flags(pn))
        })
    }
}

impl UserMemory for Process {
    /// Runs inside the fault handler, so a violation here is a fault on the
    /// exception stack and cannot be delivered: the copy aborts instead.
    fn copy_page(&self, dst: VirtAddr, src: VirtAddr) {
        let id = self.id;
        let copied = self.kernel.with_state(|st| {
            let Some(env) = st.envs.get(id) else {
                return false;
            };
            let (Some(from), Some(to)) = (env.space.lookup(src), env.space.lookup(dst)) else {
                return false;
            };
            let readable = PteFlags::PRESENT | PteFlags::USER_ACCESSIBLE;
            if !from.flags.contains(readable) || !to.flags.contains(PERM_RW) {
                return false;
            }
            st.frames.copy(to.frame, from.frame)
        });
        if !copied {
            panic!(
                "[{}] copy_page: fault copying {:#x} to {:#x} (directory {:#x})",
                id,
                src.as_u64(),
                dst.as_u64(),
                pdx(dst)
            );
        }
    }
}
