//! System call implementations
//!
//! Each `sys_*` function runs with the kernel lock held, on behalf of
//! `caller`, and performs the same argument checks in the same order for
//! every primitive: resolve the target processes, validate the addresses,
//! validate the permission bits, then act.

use libexo::errno::Errno;
use libexo::memlayout::{PGSIZE, UTOP};
use libexo::{EnvId, EnvStatus, Exofork, PteFlags, Upcall, PTE_SYSCALL};
use x86_64::VirtAddr;

use crate::memory::AddressSpace;
use crate::process::Process;
use crate::KernelState;

/// Bits every mapping request must carry.
const PERM_REQUIRED: PteFlags = PteFlags::PRESENT.union(PteFlags::USER_ACCESSIBLE);

/// `va` must be a page-aligned user address.
fn check_user_va(va: VirtAddr) -> Result<(), Errno> {
    if va.as_u64() >= UTOP || !va.is_aligned(PGSIZE) {
        return Err(Errno::EINVAL);
    }
    Ok(())
}

/// `perm` must be present and user, and within [`PTE_SYSCALL`].
fn check_perm(perm: PteFlags) -> Result<(), Errno> {
    if !perm.contains(PERM_REQUIRED) || !PTE_SYSCALL.contains(perm) {
        return Err(Errno::EINVAL);
    }
    Ok(())
}

impl KernelState {
    /// Create a not-runnable child of `caller` with an empty address space.
    ///
    /// A child calling this for the first time is resuming from the call
    /// that created it and gets [`Exofork::Child`] back instead.
    pub(crate) fn sys_exofork(&mut self, caller: EnvId) -> Result<Exofork, Errno> {
        let me = self.envs.get_mut(caller).ok_or(Errno::EBADENV)?;
        if me.resume_in_exofork {
            me.resume_in_exofork = false;
            log::debug!("[{}] sys_exofork: returning in child", caller);
            return Ok(Exofork::Child);
        }

        let slot = self.envs.free_slot().ok_or(Errno::ENOFREEENV)?;
        let space = AddressSpace::new(&mut self.frames)?;
        let child = self.envs.insert(slot, caller, EnvStatus::NotRunnable, space);
        if let Some(env) = self.envs.get_mut(child) {
            env.resume_in_exofork = true;
        }
        log::info!("[{}] new env {}", caller, child);
        Ok(Exofork::Parent(child))
    }

    pub(crate) fn sys_env_set_status(
        &mut self,
        caller: EnvId,
        envid: EnvId,
        status: EnvStatus,
    ) -> Result<(), Errno> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(Errno::EINVAL);
        }
        let target = self.envs.envid2env(caller, envid, true)?;
        let env = self.envs.get_mut(target).ok_or(Errno::EBADENV)?;
        env.status = status;
        log::debug!("[{}] sys_env_set_status: {} -> {:?}", caller, target, status);
        Ok(())
    }

    pub(crate) fn sys_env_set_pgfault_upcall(
        &mut self,
        caller: EnvId,
        envid: EnvId,
        upcall: Upcall<Process>,
    ) -> Result<(), Errno> {
        let target = self.envs.envid2env(caller, envid, true)?;
        let env = self.envs.get_mut(target).ok_or(Errno::EBADENV)?;
        env.upcall = Some(upcall);
        log::debug!("[{}] sys_env_set_pgfault_upcall: {}", caller, target);
        Ok(())
    }

    /// Map a fresh zeroed page at `va` in `envid`.
    pub(crate) fn sys_page_alloc(
        &mut self,
        caller: EnvId,
        envid: EnvId,
        va: VirtAddr,
        perm: PteFlags,
    ) -> Result<(), Errno> {
        let target = self.envs.envid2env(caller, envid, true)?;
        check_user_va(va)?;
        check_perm(perm)?;

        let env = self.envs.get_mut(target).ok_or(Errno::EBADENV)?;
        let frame = self.frames.alloc()?;
        if let Err(e) = env.space.insert(&mut self.frames, va, frame, perm) {
            self.frames.free_if_unreferenced(frame);
            return Err(e);
        }
        log::debug!(
            "[{}] sys_page_alloc: {} {:#x} {:?}",
            caller,
            target,
            va.as_u64(),
            perm
        );
        Ok(())
    }

    /// Map the page behind `srcva` in `srcenv` at `dstva` in `dstenv`.
    pub(crate) fn sys_page_map(
        &mut self,
        caller: EnvId,
        srcenv: EnvId,
        srcva: VirtAddr,
        dstenv: EnvId,
        dstva: VirtAddr,
        perm: PteFlags,
    ) -> Result<(), Errno> {
        let src = self.envs.envid2env(caller, srcenv, true)?;
        let dst = self.envs.envid2env(caller, dstenv, true)?;
        check_user_va(srcva)?;
        check_user_va(dstva)?;

        let pte = self
            .envs
            .get(src)
            .and_then(|env| env.space.lookup(srcva))
            .ok_or(Errno::EINVAL)?;
        check_perm(perm)?;
        if perm.contains(PteFlags::WRITABLE) && !pte.flags.contains(PteFlags::WRITABLE) {
            return Err(Errno::EINVAL);
        }

        let env = self.envs.get_mut(dst).ok_or(Errno::EBADENV)?;
        env.space.insert(&mut self.frames, dstva, pte.frame, perm)?;
        log::debug!(
            "[{}] sys_page_map: {} {:#x} -> {} {:#x} {:?}",
            caller,
            src,
            srcva.as_u64(),
            dst,
            dstva.as_u64(),
            perm
        );
        Ok(())
    }

    /// Remove the mapping at `va` in `envid`. Unmapping nothing succeeds.
    pub(crate) fn sys_page_unmap(
        &mut self,
        caller: EnvId,
        envid: EnvId,
        va: VirtAddr,
    ) -> Result<(), Errno> {
        let target = self.envs.envid2env(caller, envid, true)?;
        check_user_va(va)?;
        let env = self.envs.get_mut(target).ok_or(Errno::EBADENV)?;
        env.space.remove(&mut self.frames, va);
        log::debug!("[{}] sys_page_unmap: {} {:#x}", caller, target, va.as_u64());
        Ok(())
    }
}
