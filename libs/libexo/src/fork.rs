//! Copy-on-write fork
//!
//! The parent creates a blank child, then walks its own user address space
//! and maps every present page into the child. Pages that are writable (or
//! already copy-on-write) become copy-on-write in both processes; read-only
//! pages are shared as they are. Whichever process writes to a shared page
//! first takes a fault, and [`pgfault`] gives it a private copy.
//!
//! The exception stack is never shared: each child gets a fresh one before
//! it is allowed to run.

use core::fmt;

use x86_64::VirtAddr;

use crate::error::Error;
use crate::memlayout::{page_va, pdx, pgnum, uxstack_page, PFTEMP, PGSIZE, UTEXT, UXSTACKTOP};
use crate::mmu::{PteFlagsExt, PERM_COW, PERM_RW};
use crate::pgfault::UTrapframe;
use crate::runtime::{Handler, Runtime};
use crate::syscall::{Exofork, Platform};
use crate::types::{EnvId, EnvStatus};
use crate::uvpt::Inspector;

/// Result of a fork operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkResult {
    /// We are the parent; the child has this identifier.
    Parent(EnvId),
    /// We are the child.
    Child,
}

impl ForkResult {
    /// Integer form: the child's identifier in the parent, 0 in the child.
    pub fn into_raw(self) -> i32 {
        match self {
            ForkResult::Parent(child) => child.raw(),
            ForkResult::Child => 0,
        }
    }
}

/// Milestones of a fork, in the order the parent reaches them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ForkStage {
    /// The kernel has created the child; it is not runnable yet.
    Created,
    /// Every present user page has been mapped into the child.
    AddressSpaceCopied,
    /// The child has an exception stack and the fault upcall.
    HandlerInstalled,
    /// The child has been handed to the scheduler.
    Runnable,
}

impl fmt::Display for ForkStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ForkStage::Created => "created",
            ForkStage::AddressSpaceCopied => "address space copied",
            ForkStage::HandlerInstalled => "handler installed",
            ForkStage::Runnable => "runnable",
        })
    }
}

/// Copy-on-write page fault handler.
///
/// Runs on the exception stack. Only a write to a copy-on-write page can be
/// resolved; anything else is a bug in the faulting program and aborts it.
/// So does any kernel failure once resolution has started.
pub fn pgfault<P: Platform>(sys: &P, utf: &UTrapframe) {
    let addr = utf.fault_va;
    let pte = Inspector::new(sys).pte(pgnum(addr));

    if !utf.is_write() || !pte.is_present() || !pte.is_cow() {
        panic!(
            "pgfault: unrecoverable {} fault at {:#x} (err {:?}, pte {:?}, eip {:#x})",
            if utf.is_write() { "write" } else { "read" },
            addr.as_u64(),
            utf.err,
            pte,
            utf.regs.eip
        );
    }

    let page = addr.align_down(PGSIZE);
    let scratch = VirtAddr::new(PFTEMP);

    if let Err(e) = sys.page_alloc(EnvId::SELF, scratch, PERM_RW) {
        panic!("pgfault: cannot allocate copy of {:#x}: {}", page.as_u64(), e);
    }
    sys.copy_page(scratch, page);
    if let Err(e) = sys.page_map(EnvId::SELF, scratch, EnvId::SELF, page, PERM_RW) {
        panic!("pgfault: cannot map copy at {:#x}: {}", page.as_u64(), e);
    }
    if let Err(e) = sys.page_unmap(EnvId::SELF, scratch) {
        panic!("pgfault: cannot unmap scratch page: {}", e);
    }
}

/// Map page `pn` of the caller into `child`.
///
/// Writable and copy-on-write pages end up copy-on-write on both sides.
/// The parent's own entry is re-marked every time, even when it already
/// was copy-on-write, so no earlier child can be left sharing a page the
/// parent may still write. Other present pages are shared with their
/// existing bits. Absent pages are ignored.
pub fn duppage<P: Platform>(sys: &P, child: EnvId, pn: usize) -> Result<(), Error> {
    let pte = Inspector::new(sys).pte(pn);
    if !pte.is_present() {
        return Ok(());
    }
    let va = page_va(pn);

    if pte.is_writable_or_cow() {
        // Child before parent.
        sys.page_map(EnvId::SELF, va, child, va, PERM_COW)?;
        sys.page_map(EnvId::SELF, va, EnvId::SELF, va, PERM_COW)?;
        log::trace!("duppage: {:#x} -> {} cow", va.as_u64(), child);
    } else {
        sys.page_map(EnvId::SELF, va, child, va, pte.syscall_bits())?;
        log::trace!("duppage: {:#x} -> {} shared {:?}", va.as_u64(), child, pte.syscall_bits());
    }
    Ok(())
}

impl<P: Platform> Runtime<P> {
    /// Create a child process sharing this one's memory copy-on-write.
    ///
    /// Returns [`ForkResult::Parent`] in the caller and, once the child is
    /// scheduled and resumes from the same call, [`ForkResult::Child`] in
    /// the child. On error the child, if one was created, is left not
    /// runnable.
    pub fn fork(&mut self) -> Result<ForkResult, Error> {
        let child = match self.sys.exofork() {
            Ok(Exofork::Child) => {
                self.refresh_thisenv();
                log::debug!("[{}] fork: running as child", self.thisenv());
                return Ok(ForkResult::Child);
            }
            Ok(Exofork::Parent(child)) => child,
            Err(e) => {
                log::warn!("[{}] fork: exofork failed: {}", self.thisenv(), e);
                return Err(e);
            }
        };
        log::debug!("[{}] fork {}: {}", self.thisenv(), child, ForkStage::Created);

        self.advance(child, ForkStage::AddressSpaceCopied, |rt| {
            rt.copy_address_space(child)
        })?;
        self.advance(child, ForkStage::HandlerInstalled, |rt| {
            rt.install_child_handler(child)
        })?;
        self.advance(child, ForkStage::Runnable, |rt| {
            rt.sys.env_set_status(child, EnvStatus::Runnable)
        })?;

        Ok(ForkResult::Parent(child))
    }

    /// [`fork`](Runtime::fork) with the integer return convention: the
    /// child's identifier in the parent, 0 in the child, a negative error
    /// number on failure.
    pub fn fork_raw(&mut self) -> i32 {
        match self.fork() {
            Ok(result) => result.into_raw(),
            Err(e) => e.code(),
        }
    }

    fn advance<F>(&mut self, child: EnvId, stage: ForkStage, step: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Self) -> Result<(), Error>,
    {
        match step(self) {
            Ok(()) => {
                log::debug!("[{}] fork {}: {}", self.thisenv(), child, stage);
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "[{}] fork {}: failed before {}: {}; child left not runnable",
                    self.thisenv(),
                    child,
                    stage,
                    e
                );
                Err(e)
            }
        }
    }

    fn copy_address_space(&self, child: EnvId) -> Result<(), Error> {
        let xstack = pgnum(uxstack_page());
        let inspector = Inspector::new(&self.sys);
        let mut pages = 0usize;

        for dir in pdx(VirtAddr::new(UTEXT))..pdx(VirtAddr::new(UXSTACKTOP)) {
            for (pn, _) in inspector.present_pages(dir) {
                if pn == xstack {
                    continue;
                }
                duppage(&self.sys, child, pn)?;
                pages += 1;
            }
        }
        log::debug!("[{}] fork {}: {} pages shared", self.thisenv(), child, pages);
        Ok(())
    }

    fn install_child_handler(&mut self, child: EnvId) -> Result<(), Error> {
        if !self.cow_handler_installed() {
            self.install_handler(pgfault::<P>, Handler::Cow);
        }
        self.sys.page_alloc(child, uxstack_page(), PERM_RW)?;
        self.sys.env_set_pgfault_upcall(child, pgfault::<P>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno::Errno;
    use crate::mmu::PteFlags;
    use crate::syscall::{Syscalls, Upcall, UserMemory};
    use crate::uvpt::Vpt;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use x86_64::structures::idt::PageFaultErrorCode;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Alloc(EnvId, u64, PteFlags),
        Map(EnvId, u64, EnvId, u64, PteFlags),
        Unmap(EnvId, u64),
        Copy(u64, u64),
    }

    /// Records primitives and keeps only the caller's own entries.
    #[derive(Default)]
    struct Recorder {
        ptes: RefCell<BTreeMap<usize, PteFlags>>,
        calls: RefCell<Vec<Call>>,
        fail_alloc: Option<Errno>,
        fail_map: Option<Errno>,
        fail_unmap: Option<Errno>,
        fail_upcall: Option<Errno>,
    }

    impl Recorder {
        fn with_page(va: u64, flags: PteFlags) -> Self {
            let rec = Recorder::default();
            rec.ptes.borrow_mut().insert(pgnum(VirtAddr::new(va)), flags);
            rec
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.borrow().clone()
        }
    }

    impl Syscalls for Recorder {
        fn getenvid(&self) -> EnvId {
            EnvId::from_raw(0x1000)
        }
        fn exofork(&self) -> Result<Exofork, Error> {
            Err(Errno::ENOFREEENV.into())
        }
        fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PteFlags) -> Result<(), Error> {
            if let Some(e) = self.fail_alloc {
                return Err(e.into());
            }
            self.calls.borrow_mut().push(Call::Alloc(env, va.as_u64(), perm));
            if env.is_self() {
                self.ptes.borrow_mut().insert(pgnum(va), perm);
            }
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
            if let Some(e) = self.fail_map {
                return Err(e.into());
            }
            self.calls
                .borrow_mut()
                .push(Call::Map(src_env, src_va.as_u64(), dst_env, dst_va.as_u64(), perm));
            if dst_env.is_self() {
                self.ptes.borrow_mut().insert(pgnum(dst_va), perm);
            }
            Ok(())
        }
        fn page_unmap(&self, env: EnvId, va: VirtAddr) -> Result<(), Error> {
            if let Some(e) = self.fail_unmap {
                return Err(e.into());
            }
            self.calls.borrow_mut().push(Call::Unmap(env, va.as_u64()));
            self.ptes.borrow_mut().remove(&pgnum(va));
            Ok(())
        }
        fn env_set_pgfault_upcall(&self, _env: EnvId, _upcall: Upcall<Self>) -> Result<(), Error> {
            match self.fail_upcall {
                Some(e) => Err(e.into()),
                None => Ok(()),
            }
        }
        fn env_set_status(&self, _env: EnvId, _status: EnvStatus) -> Result<(), Error> {
            Ok(())
        }
    }

    impl Vpt for Recorder {
        fn uvpd(&self, dir: usize) -> PteFlags {
            let any = self
                .ptes
                .borrow()
                .keys()
                .any(|pn| pn / crate::memlayout::NPTENTRIES == dir);
            if any { PERM_RW } else { PteFlags::empty() }
        }
        fn uvpt(&self, pn: usize) -> PteFlags {
            self.ptes.borrow().get(&pn).copied().unwrap_or(PteFlags::empty())
        }
    }

    impl UserMemory for Recorder {
        fn copy_page(&self, dst: VirtAddr, src: VirtAddr) {
            self.calls.borrow_mut().push(Call::Copy(dst.as_u64(), src.as_u64()));
        }
    }

    const CHILD: EnvId = EnvId::from_raw(0x1001);
    const ME: EnvId = EnvId::SELF;

    #[test]
    fn writable_page_maps_child_then_parent() {
        let rec = Recorder::with_page(0x0080_0000, PERM_RW);
        duppage(&rec, CHILD, 0x800).unwrap();
        assert_eq!(
            rec.calls(),
            vec![
                Call::Map(ME, 0x0080_0000, CHILD, 0x0080_0000, PERM_COW),
                Call::Map(ME, 0x0080_0000, ME, 0x0080_0000, PERM_COW),
            ]
        );
    }

    #[test]
    fn cow_page_is_reasserted_in_parent() {
        let rec = Recorder::with_page(0x0080_0000, PERM_COW);
        duppage(&rec, CHILD, 0x800).unwrap();
        assert_eq!(rec.calls().len(), 2);
    }

    #[test]
    fn read_only_page_keeps_its_bits() {
        let ro = PteFlags::PRESENT | PteFlags::USER_ACCESSIBLE | PteFlags::BIT_9 | PteFlags::ACCESSED;
        let rec = Recorder::with_page(0x0080_1000, ro);
        duppage(&rec, CHILD, 0x801).unwrap();
        let shared = PteFlags::PRESENT | PteFlags::USER_ACCESSIBLE | PteFlags::BIT_9;
        assert_eq!(
            rec.calls(),
            vec![Call::Map(ME, 0x0080_1000, CHILD, 0x0080_1000, shared)]
        );
    }

    #[test]
    fn absent_page_is_a_no_op() {
        let rec = Recorder::default();
        duppage(&rec, CHILD, 0x900).unwrap();
        assert!(rec.calls().is_empty());
    }

    #[test]
    fn duppage_surfaces_mapping_failures() {
        let mut rec = Recorder::with_page(0x0080_0000, PERM_RW);
        rec.fail_map = Some(Errno::ENOMEM);
        assert_eq!(duppage(&rec, CHILD, 0x800), Err(Error::Os(Errno::ENOMEM)));
    }

    #[test]
    fn fault_handler_copies_through_scratch_page() {
        let rec = Recorder::with_page(0x0080_2000, PERM_COW);
        let utf = UTrapframe::new(
            VirtAddr::new(0x0080_2abc),
            PageFaultErrorCode::CAUSED_BY_WRITE | PageFaultErrorCode::PROTECTION_VIOLATION,
        );
        pgfault(&rec, &utf);
        assert_eq!(
            rec.calls(),
            vec![
                Call::Alloc(ME, PFTEMP, PERM_RW),
                Call::Copy(PFTEMP, 0x0080_2000),
                Call::Map(ME, PFTEMP, ME, 0x0080_2000, PERM_RW),
                Call::Unmap(ME, PFTEMP),
            ]
        );
        assert_eq!(rec.uvpt(0x802), PERM_RW);
    }

    #[test]
    #[should_panic(expected = "unrecoverable read fault")]
    fn read_fault_is_fatal() {
        let rec = Recorder::with_page(0x0080_2000, PERM_COW);
        let utf = UTrapframe::new(VirtAddr::new(0x0080_2000), PageFaultErrorCode::USER_MODE);
        pgfault(&rec, &utf);
    }

    #[test]
    #[should_panic(expected = "unrecoverable write fault")]
    fn write_to_plain_read_only_page_is_fatal() {
        let ro = PteFlags::PRESENT | PteFlags::USER_ACCESSIBLE;
        let rec = Recorder::with_page(0x0080_2000, ro);
        let utf = UTrapframe::new(VirtAddr::new(0x0080_2000), PageFaultErrorCode::CAUSED_BY_WRITE);
        pgfault(&rec, &utf);
    }

    fn cow_write_fault(rec: &Recorder) {
        let utf = UTrapframe::new(
            VirtAddr::new(0x0080_2000),
            PageFaultErrorCode::CAUSED_BY_WRITE | PageFaultErrorCode::PROTECTION_VIOLATION,
        );
        pgfault(rec, &utf);
    }

    #[test]
    #[should_panic(expected = "cannot allocate copy")]
    fn fault_handler_allocation_failure_is_fatal() {
        let mut rec = Recorder::with_page(0x0080_2000, PERM_COW);
        rec.fail_alloc = Some(Errno::ENOMEM);
        cow_write_fault(&rec);
    }

    #[test]
    #[should_panic(expected = "cannot map copy")]
    fn fault_handler_remap_failure_is_fatal() {
        let mut rec = Recorder::with_page(0x0080_2000, PERM_COW);
        rec.fail_map = Some(Errno::ENOMEM);
        cow_write_fault(&rec);
    }

    #[test]
    #[should_panic(expected = "cannot unmap scratch page")]
    fn fault_handler_unmap_failure_is_fatal() {
        let mut rec = Recorder::with_page(0x0080_2000, PERM_COW);
        rec.fail_unmap = Some(Errno::EINVAL);
        cow_write_fault(&rec);
    }

    fn ignore(_: &Recorder, _: &UTrapframe) {}

    #[test]
    fn installer_maps_the_exception_stack_once() {
        let mut rt = Runtime::bootstrap(Recorder::default());
        rt.set_pgfault_handler(ignore);
        rt.set_pgfault_handler(ignore);
        let xstack = uxstack_page().as_u64();
        assert_eq!(rt.sys().calls(), vec![Call::Alloc(ME, xstack, PERM_RW)]);
        assert!(!rt.cow_handler_installed());
    }

    #[test]
    #[should_panic(expected = "cannot map exception stack")]
    fn installer_stack_failure_is_fatal() {
        let mut rec = Recorder::default();
        rec.fail_alloc = Some(Errno::ENOMEM);
        Runtime::bootstrap(rec).set_pgfault_handler(ignore);
    }

    #[test]
    #[should_panic(expected = "cannot register upcall")]
    fn installer_registration_failure_is_fatal() {
        let mut rec = Recorder::default();
        rec.fail_upcall = Some(Errno::EBADENV);
        Runtime::bootstrap(rec).set_pgfault_handler(ignore);
    }

    #[test]
    fn fork_reports_exofork_failure() {
        let mut rt = Runtime::bootstrap(Recorder::default());
        assert_eq!(rt.fork(), Err(Error::Os(Errno::ENOFREEENV)));
        assert_eq!(rt.fork_raw(), -5);
        assert!(!rt.cow_handler_installed());
    }

    #[test]
    fn raw_fork_results() {
        assert_eq!(ForkResult::Child.into_raw(), 0);
        assert_eq!(ForkResult::Parent(CHILD).into_raw(), 0x1001);
        assert!(ForkStage::Created < ForkStage::Runnable);
    }
}
