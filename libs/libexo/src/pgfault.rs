//! User-level page fault handling support.
//!
//! A process registers a handler; on a page fault the kernel switches to
//! the process's one-page exception stack, pushes a [`UTrapframe`] and runs
//! the handler there. The exception stack is private to each process: it is
//! never shared and never copy-on-write, because the handler cannot take a
//! fault of its own.

use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::VirtAddr;

use crate::memlayout::uxstack_page;
use crate::mmu::{PteFlagsExt, PERM_RW};
use crate::runtime::{Handler, Runtime};
use crate::syscall::{Platform, Upcall};
use crate::types::EnvId;
use crate::uvpt::Inspector;

/// Register state saved at the faulting instruction.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapRegs {
    pub eip: u64,
    pub eflags: u64,
    pub esp: u64,
}

/// Fault frame the kernel pushes on the exception stack.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UTrapframe {
    /// Faulting address.
    pub fault_va: VirtAddr,
    /// Hardware error code: write access, protection violation, user mode.
    pub err: PageFaultErrorCode,
    pub regs: TrapRegs,
}

impl UTrapframe {
    pub fn new(fault_va: VirtAddr, err: PageFaultErrorCode) -> Self {
        Self {
            fault_va,
            err,
            regs: TrapRegs::default(),
        }
    }

    /// Whether the faulting access was a write.
    pub fn is_write(&self) -> bool {
        self.err.contains(PageFaultErrorCode::CAUSED_BY_WRITE)
    }
}

impl<P: Platform> Runtime<P> {
    /// Install `handler` as this process's page fault handler.
    ///
    /// Replaces any previous handler. The first installation also maps the
    /// exception stack if it is not already there. Failure aborts the
    /// process: without a handler there is no way to survive a fault.
    pub fn set_pgfault_handler(&mut self, handler: Upcall<P>) {
        self.install_handler(handler, Handler::Custom);
    }

    pub(crate) fn install_handler(&mut self, handler: Upcall<P>, kind: Handler) {
        if self.handler.is_none() {
            self.ensure_exception_stack();
        }
        if let Err(e) = self.sys.env_set_pgfault_upcall(EnvId::SELF, handler) {
            panic!("set_pgfault_handler: cannot register upcall: {}", e);
        }
        self.handler = Some(kind);
    }

    fn ensure_exception_stack(&self) {
        let xstack = uxstack_page();
        let mapped = Inspector::new(&self.sys)
            .lookup(xstack)
            .map_or(false, |pte| pte.contains(PERM_RW) && !pte.is_cow());
        if mapped {
            return;
        }
        if let Err(e) = self.sys.page_alloc(EnvId::SELF, xstack, PERM_RW) {
            panic!("set_pgfault_handler: cannot map exception stack: {}", e);
        }
        log::debug!("[{}] exception stack at {:#x}", self.thisenv(), xstack.as_u64());
    }
}
