//! Page protection bits.
//!
//! Entries use the x86 layout, so the flag type is the `x86_64` crate's
//! `PageTableFlags`. Bits 9-11 are left to software; copy-on-write lives in
//! bit 11.

pub use x86_64::structures::paging::PageTableFlags as PteFlags;

/// Marks a page that is logically writable but currently shared read-only;
/// the first write takes a private copy.
pub const PTE_COW: PteFlags = PteFlags::BIT_11;

/// Bits the kernel leaves to user policy.
pub const PTE_AVAIL: PteFlags = PteFlags::BIT_9
    .union(PteFlags::BIT_10)
    .union(PteFlags::BIT_11);

/// Bits a mapping primitive accepts in its `perm` argument.
pub const PTE_SYSCALL: PteFlags = PTE_AVAIL
    .union(PteFlags::PRESENT)
    .union(PteFlags::WRITABLE)
    .union(PteFlags::USER_ACCESSIBLE);

/// Present, user-visible, no raw write: the protection both sides of a
/// copy-on-write share end up with.
pub const PERM_COW: PteFlags = PteFlags::PRESENT
    .union(PteFlags::USER_ACCESSIBLE)
    .union(PTE_COW);

/// Present, user-visible, writable: a private page.
pub const PERM_RW: PteFlags = PteFlags::PRESENT
    .union(PteFlags::USER_ACCESSIBLE)
    .union(PteFlags::WRITABLE);

/// Copy-on-write queries on protection bits.
pub trait PteFlagsExt {
    fn is_present(&self) -> bool;
    fn is_cow(&self) -> bool;
    /// Writable now, or writable once its copy-on-write fault resolves.
    fn is_writable_or_cow(&self) -> bool;
    /// The subset of these bits a mapping primitive will accept.
    fn syscall_bits(&self) -> PteFlags;
}

impl PteFlagsExt for PteFlags {
    #[inline]
    fn is_present(&self) -> bool {
        self.contains(PteFlags::PRESENT)
    }

    #[inline]
    fn is_cow(&self) -> bool {
        self.contains(PTE_COW)
    }

    #[inline]
    fn is_writable_or_cow(&self) -> bool {
        self.intersects(PteFlags::WRITABLE | PTE_COW)
    }

    #[inline]
    fn syscall_bits(&self) -> PteFlags {
        self.intersection(PTE_SYSCALL)
    }
}
