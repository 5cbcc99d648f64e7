//! Free-slot accounting for the backing swap file.
//!
//! The live working set of free indices fits in one page (1024 entries).
//! When a free would overflow it, the working set is written out to the
//! swap file at the slot being freed, and that slot's index joins an
//! in-RAM list of overflow pages. When the working set drains and overflow
//! pages exist, the head page is read back and its own slot is handed out
//! as the allocation, so no slot is ever stranded. With no overflow left, a
//! bump pointer issues fresh slots from the end of the file.
//!
//! An overflow page's index is published only after its write completed,
//! so a concurrent `get_swap_index` can never read a page still in flight;
//! it falls through to the bump pointer instead.

use std::sync::Arc;

use sos_kernel_model::Word;

use crate::error::SosResult;
use crate::layout::PAGE_SIZE;
use crate::server::Server;
use crate::vfs::{Uio, UioTarget};

/// Free indices held in memory at once: one page's worth.
pub const WORKING_SET: usize = PAGE_SIZE / core::mem::size_of::<Word>();

pub struct SwapFreeList {
    working: Vec<Word>,
    /// Slots holding overflow pages, most recent last.
    overflow: Vec<Word>,
    /// Next never-used slot at the end of the file.
    end_index: Word,
}

impl SwapFreeList {
    pub fn new() -> Self {
        Self {
            working: Vec::with_capacity(WORKING_SET),
            overflow: Vec::new(),
            end_index: 0,
        }
    }

    /// Indices currently reusable without touching the file.
    pub fn cached(&self) -> usize {
        self.working.len()
    }
}

impl Default for SwapFreeList {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate a free page slot in the swap file. May perform I/O.
pub fn get_swap_index(server: &Arc<Server>) -> SosResult<Word> {
    {
        let mut swap = server.swap.lock();
        if let Some(index) = swap.working.pop() {
            return Ok(index);
        }
        if swap.overflow.is_empty() {
            let index = swap.end_index;
            swap.end_index += 1;
            log::trace!("swap index from bump pointer: {index}");
            return Ok(index);
        }
    }

    // Working set is dry but an overflow page exists: read it back into the
    // working set. The slot the page occupied is the allocation result.
    let head = {
        let mut swap = server.swap.lock();
        match swap.overflow.pop() {
            Some(head) => head,
            // Another coroutine refilled while we were between locks.
            None => {
                let index = swap.end_index;
                swap.end_index += 1;
                return Ok(index);
            }
        }
    };

    let mut buf = vec![0u8; PAGE_SIZE];
    let mut uio = Uio::new(
        UioTarget::Buffer(&mut buf),
        PAGE_SIZE,
        u64::from(head) * PAGE_SIZE as u64,
    );
    server.swap_vnode().read(server, &mut uio)?;

    let entries: Vec<Word> = buf
        .chunks_exact(4)
        .map(|c| Word::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    // Frees may have landed while the read was in flight; anything that no
    // longer fits goes back through the free path.
    let spill: Vec<Word> = {
        let mut swap = server.swap.lock();
        let room = WORKING_SET - swap.working.len();
        let (keep, spill) = entries.split_at(room.min(entries.len()));
        swap.working.extend_from_slice(keep);
        spill.to_vec()
    };
    for index in spill {
        free_swap_index(server, index)?;
    }

    log::trace!("refilled swap free list from overflow page at slot {head}");
    Ok(head)
}

/// Return a page slot to the free list. May perform I/O.
pub fn free_swap_index(server: &Arc<Server>, index: Word) -> SosResult<()> {
    let full = {
        let mut swap = server.swap.lock();
        if swap.working.len() < WORKING_SET {
            swap.working.push(index);
            None
        } else {
            Some(core::mem::take(&mut swap.working))
        }
    };

    let Some(entries) = full else {
        return Ok(());
    };

    // The freed slot itself stores the overflowed page.
    let mut buf = vec![0u8; PAGE_SIZE];
    for (chunk, value) in buf.chunks_exact_mut(4).zip(entries.iter()) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    let mut uio = Uio::new(
        UioTarget::Buffer(&mut buf),
        PAGE_SIZE,
        u64::from(index) * PAGE_SIZE as u64,
    );
    server.swap_vnode().write(server, &mut uio)?;
    server.swap.lock().overflow.push(index);
    log::trace!("swap free list overflowed into slot {index}");
    Ok(())
}
