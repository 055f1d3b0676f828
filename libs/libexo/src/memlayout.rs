//! User address-space layout
//!
//! Two-level translation: a 1024-entry page directory whose entries each
//! cover a 1024-entry page table of 4 KiB pages. Every process shares this
//! layout; the kernel owns everything from `ULIM` up.
//!
//! ```text
//!    ULIM      0xef800000  ---------------------------------
//!                          |  read-only page-table view     |
//!    UTOP/UXSTACKTOP       ---------------------------------  0xeec00000
//!                          |  user exception stack (1 page) |
//!                          ---------------------------------
//!                          |  empty guard page              |
//!    USTACKTOP             ---------------------------------  0xeebfe000
//!                          |  normal user stack             |
//!                          ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//!                          |  program data & heap           |
//!    UTEXT     0x00800000  ---------------------------------
//!    PFTEMP    0x007ff000  |  fault-handler scratch page    |
//!    UTEMP     0x00400000  ---------------------------------
//! ```

use x86_64::VirtAddr;

pub const PGSHIFT: u32 = 12;
pub const PGSIZE: u64 = 1 << PGSHIFT;                // 4 KiB

pub const PTXSHIFT: u32 = 12;
pub const PDXSHIFT: u32 = 22;

pub const NPDENTRIES: usize = 1024;                  // directory entries
pub const NPTENTRIES: usize = 1024;                  // entries per page table

/// Bytes mapped by one page-directory entry.
pub const PTSIZE: u64 = PGSIZE * NPTENTRIES as u64;  // 4 MiB

pub const ULIM: u64 = 0xef80_0000;
pub const UTOP: u64 = 0xeec0_0000;

/// Top of the one-page user exception stack.
pub const UXSTACKTOP: u64 = UTOP;
/// Top of the normal user stack; one unmapped page separates it from the exception stack.
pub const USTACKTOP: u64 = UTOP - 2 * PGSIZE;

/// Where user programs generally begin.
pub const UTEXT: u64 = 2 * PTSIZE;
/// Scratch region for temporary mappings.
pub const UTEMP: u64 = PTSIZE;
/// Temporary page the COW fault handler copies through.
pub const PFTEMP: u64 = UTEMP + PTSIZE - PGSIZE;

/// Page-directory index of `va`.
#[inline]
pub const fn pdx(va: VirtAddr) -> usize {
    ((va.as_u64() >> PDXSHIFT) & 0x3ff) as usize
}

/// Page-table index of `va`.
#[inline]
pub const fn ptx(va: VirtAddr) -> usize {
    ((va.as_u64() >> PTXSHIFT) & 0x3ff) as usize
}

/// Page number of `va`.
#[inline]
pub const fn pgnum(va: VirtAddr) -> usize {
    (va.as_u64() >> PGSHIFT) as usize
}

/// Address of entry `ptx` in the table under directory slot `pdx`.
#[inline]
pub fn pgaddr(pdx: usize, ptx: usize) -> VirtAddr {
    VirtAddr::new(((pdx as u64) << PDXSHIFT) | ((ptx as u64) << PTXSHIFT))
}

/// First address of page number `pn`.
#[inline]
pub fn page_va(pn: usize) -> VirtAddr {
    VirtAddr::new((pn as u64) << PGSHIFT)
}

/// Page holding the user exception stack.
#[inline]
pub fn uxstack_page() -> VirtAddr {
    VirtAddr::new(UXSTACKTOP - PGSIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_constants_match_the_map() {
        assert_eq!(PFTEMP, 0x007f_f000);
        assert_eq!(UTEXT, 0x0080_0000);
        assert_eq!(USTACKTOP, 0xeebf_e000);
        assert!(PFTEMP < UTEXT, "scratch page must sit below the fork scan range");
    }

    #[test]
    fn index_helpers_round_trip() {
        let va = VirtAddr::new(0x0080_3123);
        assert_eq!(pdx(va), 2);
        assert_eq!(ptx(va), 3);
        assert_eq!(pgnum(va), 0x803);
        assert_eq!(pgaddr(pdx(va), ptx(va)), VirtAddr::new(0x0080_3000));
        assert_eq!(page_va(pgnum(va)), va.align_down(PGSIZE));
    }

    #[test]
    fn exception_stack_shares_a_directory_with_the_user_stack() {
        assert_eq!(pdx(uxstack_page()), pdx(VirtAddr::new(USTACKTOP - PGSIZE)));
        assert_eq!(pdx(VirtAddr::new(UXSTACKTOP)), 0x3bb);
    }
}
