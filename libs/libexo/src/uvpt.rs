//! Read-only view of the current address space's translation tables.
//!
//! The kernel maps each process's page directory and page tables read-only
//! into that process, so protection bits can be read with plain loads and
//! no privileged call. Reading is always safe: the view itself is always
//! mapped. Asking about the kernel's half of the address space is a
//! programming error.

use x86_64::VirtAddr;

use crate::memlayout::{pgnum, NPDENTRIES, NPTENTRIES, ULIM};
use crate::mmu::{PteFlags, PteFlagsExt};

/// Raw page-directory and page-table entries of the calling process.
pub trait Vpt {
    /// Flags of page-directory entry `pdx`.
    fn uvpd(&self, pdx: usize) -> PteFlags;

    /// Flags of the page-table entry for page number `pn`. Only meaningful
    /// when the covering directory entry is present.
    fn uvpt(&self, pn: usize) -> PteFlags;
}

const ULIM_PDX: usize = (ULIM >> 22) as usize;
const ULIM_PGNUM: usize = (ULIM >> 12) as usize;

/// Range-checked queries over a [`Vpt`].
pub struct Inspector<'a, V: Vpt + ?Sized> {
    vpt: &'a V,
}

impl<'a, V: Vpt + ?Sized> Inspector<'a, V> {
    pub fn new(vpt: &'a V) -> Self {
        Self { vpt }
    }

    /// Whether directory slot `pdx` has a page table behind it.
    pub fn pde_present(&self, pdx: usize) -> bool {
        assert!(
            pdx < ULIM_PDX && pdx < NPDENTRIES,
            "uvpd: directory slot {:#x} is outside the user view",
            pdx
        );
        self.vpt.uvpd(pdx).is_present()
    }

    /// Protection bits of page `pn`; empty when its directory entry is absent.
    pub fn pte(&self, pn: usize) -> PteFlags {
        assert!(
            pn < ULIM_PGNUM,
            "uvpt: page {:#x} is outside the user view",
            pn
        );
        if !self.pde_present(pn / NPTENTRIES) {
            return PteFlags::empty();
        }
        self.vpt.uvpt(pn)
    }

    /// Protection bits of the page containing `va`, if it is mapped.
    pub fn lookup(&self, va: VirtAddr) -> Option<PteFlags> {
        let pte = self.pte(pgnum(va));
        pte.is_present().then_some(pte)
    }

    /// Whether the page containing `va` is mapped.
    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        self.lookup(va).is_some()
    }

    /// Every present page in directory slot `pdx`, as `(page number, flags)`.
    pub fn present_pages(&self, pdx: usize) -> impl Iterator<Item = (usize, PteFlags)> + '_ {
        let first = pdx * NPTENTRIES;
        let last = if self.pde_present(pdx) { first + NPTENTRIES } else { first };
        (first..last)
            .map(move |pn| (pn, self.vpt.uvpt(pn)))
            .filter(|(_, pte)| pte.is_present())
    }
}
