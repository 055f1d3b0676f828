//! The process table
//!
//! A fixed array of slots. An identifier is `generation | slot`; the
//! generation moves forward every time a slot is reused, so an identifier
//! held after its process died never resolves to the slot's next occupant.

use libexo::errno::Errno;
use libexo::{EnvId, EnvStatus, Upcall, NENV};

use super::Process;
use crate::memory::AddressSpace;

/// One live process.
pub(crate) struct Env {
    pub id: EnvId,
    pub parent: EnvId,
    pub status: EnvStatus,
    pub space: AddressSpace,
    pub upcall: Option<Upcall<Process>>,
    /// Created by exofork and not yet returned from it.
    pub resume_in_exofork: bool,
    /// A fault upcall is running.
    pub in_upcall: bool,
}

/// Public view of a process-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    pub id: EnvId,
    /// Creator, or [`EnvId::SELF`] for processes the kernel started itself.
    pub parent: EnvId,
    pub status: EnvStatus,
    pub has_upcall: bool,
}

impl Env {
    pub fn info(&self) -> EnvInfo {
        EnvInfo {
            id: self.id,
            parent: self.parent,
            status: self.status,
            has_upcall: self.upcall.is_some(),
        }
    }
}

pub(crate) struct EnvTable {
    slots: Vec<Option<Env>>,
    /// Last identifier issued from each slot.
    last_ids: Vec<i32>,
}

impl EnvTable {
    pub fn new(max_envs: usize) -> Self {
        let n = max_envs.min(NENV);
        Self {
            slots: (0..n).map(|_| None).collect(),
            last_ids: vec![0; n],
        }
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Put a new process in `slot` and return its identifier.
    pub fn insert(&mut self, slot: usize, parent: EnvId, status: EnvStatus, space: AddressSpace) -> EnvId {
        let id = next_id(self.last_ids[slot], slot);
        self.last_ids[slot] = id.raw();
        self.slots[slot] = Some(Env {
            id,
            parent,
            status,
            space,
            upcall: None,
            resume_in_exofork: false,
            in_upcall: false,
        });
        id
    }

    pub fn get(&self, id: EnvId) -> Option<&Env> {
        self.slots
            .get(id.envx())
            .and_then(Option::as_ref)
            .filter(|env| env.id == id)
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.slots
            .get_mut(id.envx())
            .and_then(Option::as_mut)
            .filter(|env| env.id == id)
    }

    pub fn remove(&mut self, id: EnvId) -> Option<Env> {
        self.get(id)?;
        self.slots[id.envx()].take()
    }

    /// Resolve `id` as named by `caller`.
    ///
    /// [`EnvId::SELF`] means the caller. With `checkperm`, the target must
    /// be the caller or one of its immediate children.
    pub fn envid2env(&self, caller: EnvId, id: EnvId, checkperm: bool) -> Result<EnvId, Errno> {
        if id.is_self() {
            return self.get(caller).map(|env| env.id).ok_or(Errno::EBADENV);
        }
        let env = self.get(id).ok_or(Errno::EBADENV)?;
        if checkperm && env.id != caller && env.parent != caller {
            return Err(Errno::EBADENV);
        }
        Ok(env.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Env> + '_ {
        self.slots.iter().flatten()
    }
}

/// Identifier for the next process in `slot`, given the slot's previous one.
fn next_id(last: i32, slot: usize) -> EnvId {
    let mut generation = last.wrapping_add(NENV as i32) & !(NENV as i32 - 1);
    if generation <= 0 {
        generation = NENV as i32;
    }
    EnvId::from_raw(generation | slot as i32)
}
