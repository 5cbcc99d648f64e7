//! Capability slots and the kernel objects they name.

use crate::{CPtr, KernelError, KernelModel, Result, Word};

/// A kernel object reachable through a capability slot.
#[derive(Debug, Clone)]
pub(crate) enum Object {
    /// One 4 KiB physical frame; `page` indexes the arena.
    Frame { page: usize },
    /// A second-level page table (pure bookkeeping once mapped).
    PageTable,
    /// A top-level page directory backing a virtual address space.
    PageDirectory { vs: usize },
    /// Thread control block.
    Tcb { id: usize },
    /// IPC endpoint; minted copies carry a badge.
    Endpoint { ep: usize, badge: Option<Word> },
    /// One-shot reply capability for a client call. Replies to faults
    /// resume the client thread and carry no data.
    Reply { badge: Word, fault: bool },
}

#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub obj: Object,
    /// For frame capabilities: where this particular capability is mapped.
    pub mapped: Option<(usize, Word)>,
}

impl KernelModel {
    pub(crate) fn install(&mut self, obj: Object) -> Result<CPtr> {
        let slot = Slot { obj, mapped: None };
        // Reuse the first free slot before growing the table.
        for (i, s) in self.slots.iter_mut().enumerate().skip(1) {
            if s.is_none() {
                *s = Some(slot);
                return Ok(i as CPtr);
            }
        }
        self.slots.push(Some(slot));
        Ok((self.slots.len() - 1) as CPtr)
    }

    pub(crate) fn slot(&self, cptr: CPtr) -> Result<&Slot> {
        self.slots
            .get(cptr as usize)
            .and_then(|s| s.as_ref())
            .ok_or(KernelError::InvalidCap)
    }

    pub(crate) fn slot_mut(&mut self, cptr: CPtr) -> Result<&mut Slot> {
        self.slots
            .get_mut(cptr as usize)
            .and_then(|s| s.as_mut())
            .ok_or(KernelError::InvalidCap)
    }

    /// Copy a capability into a fresh slot. The copy starts unmapped.
    pub fn cap_copy(&mut self, cptr: CPtr) -> Result<CPtr> {
        let obj = self.slot(cptr)?.obj.clone();
        self.install(obj)
    }

    /// Mint a badged copy of an endpoint capability.
    pub fn cap_mint(&mut self, cptr: CPtr, badge: Word) -> Result<CPtr> {
        match self.slot(cptr)?.obj {
            Object::Endpoint { ep, .. } => self.install(Object::Endpoint {
                ep,
                badge: Some(badge),
            }),
            _ => Err(KernelError::BadObject),
        }
    }

    /// Delete a capability. Deleting a mapped frame capability unmaps it
    /// first, as the kernel would.
    pub fn cap_delete(&mut self, cptr: CPtr) -> Result<()> {
        let mapped = self.slot(cptr)?.mapped;
        if let Some((vs, vaddr)) = mapped {
            self.vspaces[vs].maps.remove(&vaddr);
        }
        self.slots[cptr as usize] = None;
        Ok(())
    }

    /// Free a capability slot without object side effects (used for spent
    /// reply capabilities).
    pub fn free_slot(&mut self, cptr: CPtr) {
        if (cptr as usize) < self.slots.len() {
            self.slots[cptr as usize] = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn live_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
