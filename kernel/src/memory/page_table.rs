//! Per-process two-level page tables
//!
//! A process's address space is a page directory plus one page table for
//! each 4 MiB region that has ever held a mapping. Both consume a physical
//! page from the [`FrameTable`], so a process can run out of memory while
//! merely extending its tables.

use std::collections::BTreeMap;

use libexo::errno::Errno;
use libexo::memlayout::{pdx, ptx, NPTENTRIES};
use libexo::{PteFlags, PteFlagsExt};
use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

use super::frame_metadata::FrameTable;

/// One present page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    pub frame: PhysFrame,
    pub flags: PteFlags,
}

struct PageTable {
    frame: PhysFrame,
    entries: BTreeMap<usize, Pte>,
}

/// Flags every present directory entry carries. Protection is decided by
/// the page-table entry alone.
const PDE_FLAGS: PteFlags = PteFlags::PRESENT
    .union(PteFlags::WRITABLE)
    .union(PteFlags::USER_ACCESSIBLE);

/// Translation tables of one process.
pub struct AddressSpace {
    pgdir: PhysFrame,
    tables: BTreeMap<usize, PageTable>,
}

impl AddressSpace {
    /// Allocate an empty page directory.
    pub fn new(frames: &mut FrameTable) -> Result<Self, Errno> {
        let pgdir = frames.alloc()?;
        frames.incref(pgdir);
        Ok(Self {
            pgdir,
            tables: BTreeMap::new(),
        })
    }

    /// Flags of directory entry `pdx`; empty when no table is present.
    pub fn pde_flags(&self, pdx: usize) -> PteFlags {
        if self.tables.contains_key(&pdx) {
            PDE_FLAGS
        } else {
            PteFlags::empty()
        }
    }

    /// Flags of the entry for page number `pn`; empty when unmapped.
    pub fn pte_flags(&self, pn: usize) -> PteFlags {
        self.tables
            .get(&(pn / NPTENTRIES))
            .and_then(|t| t.entries.get(&(pn % NPTENTRIES)))
            .map_or(PteFlags::empty(), |pte| pte.flags)
    }

    pub fn lookup(&self, va: VirtAddr) -> Option<Pte> {
        self.tables
            .get(&pdx(va))
            .and_then(|t| t.entries.get(&ptx(va)))
            .copied()
    }

    /// Map `frame` at `va` with `flags`, replacing any existing mapping.
    ///
    /// The new reference is taken before the old one is dropped, so mapping
    /// a page over itself never frees it in between.
    pub fn insert(
        &mut self,
        frames: &mut FrameTable,
        va: VirtAddr,
        frame: PhysFrame,
        flags: PteFlags,
    ) -> Result<(), Errno> {
        debug_assert!(flags.is_present());
        let dir = pdx(va);
        if !self.tables.contains_key(&dir) {
            let table_frame = frames.alloc()?;
            frames.incref(table_frame);
            self.tables.insert(
                dir,
                PageTable {
                    frame: table_frame,
                    entries: BTreeMap::new(),
                },
            );
        }
        frames.incref(frame);
        let old = self
            .tables
            .get_mut(&dir)
            .and_then(|t| t.entries.insert(ptx(va), Pte { frame, flags }));
        if let Some(old) = old {
            frames.decref(old.frame);
        }
        Ok(())
    }

    /// Remove the mapping at `va`, if any. Returns whether one existed.
    pub fn remove(&mut self, frames: &mut FrameTable, va: VirtAddr) -> bool {
        let old = self
            .tables
            .get_mut(&pdx(va))
            .and_then(|t| t.entries.remove(&ptx(va)));
        match old {
            Some(pte) => {
                frames.decref(pte.frame);
                true
            }
            None => false,
        }
    }

    /// Every present mapping, in address order.
    pub fn mappings(&self) -> impl Iterator<Item = (usize, Pte)> + '_ {
        self.tables.iter().flat_map(|(dir, table)| {
            table
                .entries
                .iter()
                .map(move |(idx, pte)| (dir * NPTENTRIES + idx, *pte))
        })
    }

    /// Drop every reference this address space holds, tables included.
    pub fn teardown(self, frames: &mut FrameTable) {
        for table in self.tables.into_values() {
            for pte in table.entries.into_values() {
                frames.decref(pte.frame);
            }
            frames.decref(table.frame);
        }
        frames.decref(self.pgdir);
    }
}
