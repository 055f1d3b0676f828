//! Physical pages and their reference counts
//!
//! Every allocated page is tracked here with the number of page-table
//! entries that point at it. A page is released as soon as that count
//! drops back to zero, so copy-on-write sharing between processes costs one
//! increment per extra mapping and nothing else.
//!
//! Design decisions:
//! - BTreeMap keyed by physical address (sparse; addresses are recycled)
//! - A freshly allocated page starts at refcount 0 until it is mapped
//! - The page budget counts every allocated page, including page
//!   directories and page tables

use std::collections::BTreeMap;

use libexo::errno::Errno;
use libexo::memlayout::PGSIZE;
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

/// First physical address handed out; everything below is "firmware".
const FIRST_FRAME: u64 = 0x0010_0000;

/// Contents and bookkeeping for one physical page
struct FrameMetadata {
    /// Number of page-table entries referencing this frame
    /// 0 = allocated but not yet mapped
    /// 1 = private to one mapping
    /// >1 = shared
    refcount: u32,
    data: Box<[u8; PGSIZE as usize]>,
}

/// All physical memory of one kernel instance.
pub struct FrameTable {
    frames: BTreeMap<u64, FrameMetadata>,
    recycled: Vec<u64>,
    next: u64,
    budget: usize,
}

impl FrameTable {
    pub fn new(budget: usize) -> Self {
        Self {
            frames: BTreeMap::new(),
            recycled: Vec::new(),
            next: FIRST_FRAME,
            budget,
        }
    }

    /// Allocate a zero-filled page with refcount 0.
    pub fn alloc(&mut self) -> Result<PhysFrame, Errno> {
        if self.frames.len() >= self.budget {
            log::debug!("frame_alloc: budget of {} pages exhausted", self.budget);
            return Err(Errno::ENOMEM);
        }
        let addr = match self.recycled.pop() {
            Some(addr) => addr,
            None => {
                let addr = self.next;
                self.next += PGSIZE;
                addr
            }
        };
        self.frames.insert(
            addr,
            FrameMetadata {
                refcount: 0,
                data: Box::new([0; PGSIZE as usize]),
            },
        );
        Ok(PhysFrame::containing_address(PhysAddr::new(addr)))
    }

    /// Release a page that was allocated but never mapped.
    pub fn free_if_unreferenced(&mut self, frame: PhysFrame) {
        let addr = frame.start_address().as_u64();
        if self.frames.get(&addr).map_or(false, |m| m.refcount == 0) {
            self.release(addr);
        }
    }

    /// Increment reference count for a frame
    /// Called for every new page-table entry that points at it
    pub fn incref(&mut self, frame: PhysFrame) {
        let addr = frame.start_address().as_u64();
        match self.frames.get_mut(&addr) {
            Some(meta) => meta.refcount += 1,
            None => log::error!("frame_incref: frame {:#x} is not allocated", addr),
        }
    }

    /// Decrement reference count for a frame
    /// Returns true if the frame was freed (refcount reached 0)
    pub fn decref(&mut self, frame: PhysFrame) -> bool {
        let addr = frame.start_address().as_u64();
        let Some(meta) = self.frames.get_mut(&addr) else {
            log::error!("frame_decref: frame {:#x} is not allocated", addr);
            return false;
        };
        if meta.refcount == 0 {
            log::error!("frame_decref: underflow for frame {:#x}", addr);
            self.release(addr);
            return true;
        }
        meta.refcount -= 1;
        if meta.refcount == 0 {
            self.release(addr);
            return true;
        }
        false
    }

    /// Current reference count; 0 for frames that are not allocated.
    pub fn refcount(&self, frame: PhysFrame) -> u32 {
        self.frames
            .get(&frame.start_address().as_u64())
            .map_or(0, |m| m.refcount)
    }

    pub fn in_use(&self) -> usize {
        self.frames.len()
    }

    pub fn set_budget(&mut self, budget: usize) {
        self.budget = budget;
    }

    pub fn data(&self, frame: PhysFrame) -> Option<&[u8; PGSIZE as usize]> {
        self.frames
            .get(&frame.start_address().as_u64())
            .map(|m| &*m.data)
    }

    pub fn data_mut(&mut self, frame: PhysFrame) -> Option<&mut [u8; PGSIZE as usize]> {
        self.frames
            .get_mut(&frame.start_address().as_u64())
            .map(|m| &mut *m.data)
    }

    /// Copy the whole of `src` into `dst`.
    pub fn copy(&mut self, dst: PhysFrame, src: PhysFrame) -> bool {
        let Some(bytes) = self.data(src).map(|d| *d) else {
            return false;
        };
        match self.data_mut(dst) {
            Some(d) => {
                *d = bytes;
                true
            }
            None => false,
        }
    }

    fn release(&mut self, addr: u64) {
        self.frames.remove(&addr);
        self.recycled.push(addr);
    }
}
