//! Frame table: every physical frame the server manages.
//!
//! The table densely covers the window `[base, high)`; conversion between a
//! frame's server virtual address and its table index is arithmetic. Each
//! entry carries the server's mapping capability, the single application
//! capability lending the frame to a client, a free-list successor, and the
//! status mask driving second-chance eviction.
//!
//! Allocation order: free list, then fresh untyped memory, then eviction.
//! Eviction writes the victim to the swap file through the VFS; that write
//! suspends the calling coroutine, so the table lock is never held across
//! it.

use std::sync::Arc;

use sos_kernel_model::{CPtr, ObjectType, Rights, Word, CAP_NULL, PAGE_BITS};

use crate::error::{SosError, SosResult};
use crate::layout::{page_align, FRAME_WINDOW_BASE, PAGE_SIZE};
use crate::proc::Pid;
use crate::server::Server;
use crate::vfs::{Uio, UioTarget};
use crate::vm;

bitflags::bitflags! {
    /// Frame status mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        /// Frame is allocated.
        const VALID = 1 << 0;
        /// Eligible for eviction. Cleared for page-table pages, IPC buffer
        /// pages, coroutine stacks, and pinned user buffers.
        const SWAPPABLE = 1 << 1;
        /// Accessed since the last sweep of the eviction hand.
        const REFERENCE = 1 << 2;
    }
}

/// The frame table's record of which client a frame is lent to.
#[derive(Debug, Clone)]
pub struct AppCap {
    pub cap: CPtr,
    pub pid: Pid,
    pub uaddr: Word,
}

#[derive(Debug, Clone)]
struct FrameEntry {
    /// Server-side mapping capability. `CAP_NULL` until the frame is first
    /// retyped.
    cap: CPtr,
    app_cap: Option<AppCap>,
    next_index: i32,
    flags: FrameFlags,
    /// Coroutine waiting for this frame's in-flight eviction to finish.
    waiter: Option<usize>,
}

impl FrameEntry {
    const fn empty() -> Self {
        Self {
            cap: CAP_NULL,
            app_cap: None,
            next_index: -1,
            flags: FrameFlags::empty(),
            waiter: None,
        }
    }
}

pub struct FrameTable {
    entries: Vec<FrameEntry>,
    /// Physical base of the tracked frames, above the table's own storage.
    base_paddr: Word,
    low: Word,
    /// Head of the free list, -1 when empty.
    free_head: i32,
    /// Second-chance hand.
    victim: usize,
    /// Frames handed out from untyped memory so far.
    from_untyped: usize,
    /// Cap on `from_untyped`; exercised by tests to force eviction early.
    frame_limit: Option<usize>,
    evictions: u64,
}

impl FrameTable {
    /// Size the table for the window `[low, high)` and charge its storage
    /// to untyped memory. The split point solves
    /// `(base - low) / entry_size == (high - base) / page_size` so the
    /// table's storage plus the frames it tracks just fit the window.
    pub fn init(kernel: &mut sos_kernel_model::KernelModel, frame_limit: Option<usize>) -> Self {
        let (low, high) = kernel.memory_window();
        let entry_size = core::mem::size_of::<FrameEntry>() as u64;
        let page = PAGE_SIZE as u64;
        let base = (u64::from(high) * entry_size + page * u64::from(low)) / (entry_size + page);
        let base = ((base + page - 1) & !(page - 1)) as Word;
        let table_bytes = (base - low) as usize;
        let num_frames = ((high - base) as usize) >> PAGE_BITS;

        kernel
            .ut_steal(table_bytes)
            .expect("frame table storage must fit the window");

        log::info!(
            "frame table: window {low:#x}..{high:#x}, {num_frames} frames above {base:#x}"
        );

        Self {
            entries: vec![FrameEntry::empty(); num_frames],
            base_paddr: base,
            low,
            free_head: -1,
            victim: 0,
            from_untyped: 0,
            frame_limit,
            evictions: 0,
        }
    }

    #[inline]
    pub fn index_to_vaddr(&self, index: usize) -> Word {
        ((index as Word) << PAGE_BITS) + self.base_paddr - self.low + FRAME_WINDOW_BASE
    }

    #[inline]
    pub fn vaddr_to_index(&self, vaddr: Word) -> usize {
        ((vaddr - FRAME_WINDOW_BASE + self.low - self.base_paddr) >> PAGE_BITS) as usize
    }

    #[inline]
    fn paddr_to_vaddr(&self, paddr: Word) -> Word {
        paddr - self.low + FRAME_WINDOW_BASE
    }

    fn entry(&self, vaddr: Word) -> &FrameEntry {
        &self.entries[self.vaddr_to_index(page_align(vaddr))]
    }

    fn entry_mut(&mut self, vaddr: Word) -> &mut FrameEntry {
        let index = self.vaddr_to_index(page_align(vaddr));
        &mut self.entries[index]
    }

    /// Server-side mapping capability for a frame.
    pub fn cap_of(&self, vaddr: Word) -> CPtr {
        self.entry(vaddr).cap
    }

    pub fn flags_of(&self, vaddr: Word) -> FrameFlags {
        self.entry(vaddr).flags
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Number of live (VALID) frames.
    pub fn used_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.flags.contains(FrameFlags::VALID))
            .count()
    }

    fn reset_mask(&mut self, index: usize) {
        self.entries[index].flags = FrameFlags::VALID | FrameFlags::SWAPPABLE | FrameFlags::REFERENCE;
        self.entries[index].waiter = None;
    }

    /// Pop the free-list head. Caller zeroes the frame.
    fn pop_free(&mut self) -> Option<Word> {
        if self.free_head < 0 {
            return None;
        }
        let index = self.free_head as usize;
        self.free_head = self.entries[index].next_index;
        self.reset_mask(index);
        Some(self.index_to_vaddr(index))
    }

    /// Record the unique client mapping of a frame. Shared mappings are not
    /// supported: a second registration is an error.
    pub fn insert_app_cap(&mut self, vaddr: Word, cap: CPtr, pid: Pid, uaddr: Word) -> SosResult<()> {
        let entry = self.entry_mut(vaddr);
        if entry.cap == CAP_NULL {
            return Err(SosError::BadArgument);
        }
        if entry.app_cap.is_some() {
            return Err(SosError::AlreadyMapped);
        }
        entry.app_cap = Some(AppCap { cap, pid, uaddr });
        Ok(())
    }

    pub fn app_cap_of(&self, vaddr: Word) -> Option<AppCap> {
        self.entry(vaddr).app_cap.clone()
    }

    pub fn take_app_cap(&mut self, vaddr: Word) -> Option<AppCap> {
        self.entry_mut(vaddr).app_cap.take()
    }

    pub fn set_waiter(&mut self, vaddr: Word, coroutine: usize) {
        self.entry_mut(vaddr).waiter = Some(coroutine);
    }

    /// Clear a frame's reference bit, making it the sweep's next victim.
    pub fn clear_reference(&mut self, vaddr: Word) {
        self.entry_mut(vaddr).flags.remove(FrameFlags::REFERENCE);
    }
}

/// Allocate a zeroed, swappable frame, evicting if memory is exhausted.
pub fn frame_alloc(server: &Arc<Server>) -> SosResult<Word> {
    match try_alloc(server) {
        Err(SosError::NoMemory) => {}
        other => return other,
    }
    // Out of untyped memory: evict one frame, then retry. Eviction leaves
    // the freed frame at the free-list head and nothing runs between its
    // return and the retry, so a second failure means eviction is broken.
    swap_out(server)?;
    try_alloc(server)
}

/// As [`frame_alloc`], but the frame is exempt from eviction. Used for
/// page-table pages, IPC buffer pages and coroutine stacks.
pub fn unswappable_alloc(server: &Arc<Server>) -> SosResult<Word> {
    let vaddr = frame_alloc(server)?;
    let mut frames = server.frames.lock();
    let entry = frames.entry_mut(vaddr);
    entry.flags.remove(FrameFlags::SWAPPABLE);
    Ok(vaddr)
}

fn try_alloc(server: &Arc<Server>) -> SosResult<Word> {
    let mut frames = server.frames.lock();
    if let Some(vaddr) = frames.pop_free() {
        drop(frames);
        zero_frame(server, vaddr)?;
        return Ok(vaddr);
    }

    if let Some(limit) = frames.frame_limit {
        if frames.from_untyped >= limit {
            return Err(SosError::NoMemory);
        }
    }

    let mut kernel = server.kernel.lock();
    let paddr = match kernel.ut_alloc(PAGE_BITS) {
        Ok(p) => p,
        Err(_) => return Err(SosError::NoMemory),
    };
    let cap = match kernel.untyped_retype(paddr, ObjectType::Frame) {
        Ok(c) => c,
        Err(_) => {
            kernel.ut_free(paddr, PAGE_BITS);
            return Err(SosError::InternalMapError);
        }
    };
    let vaddr = frames.paddr_to_vaddr(paddr);
    let server_pd = kernel.server_pd();
    if let Err(err) = kernel.page_map(cap, server_pd, vaddr, Rights::ALL) {
        log::error!("mapping frame {vaddr:#x} into the server window: {err}");
        let _ = kernel.cap_delete(cap);
        kernel.ut_free(paddr, PAGE_BITS);
        return Err(SosError::InternalMapError);
    }
    drop(kernel);

    let index = frames.vaddr_to_index(vaddr);
    frames.reset_mask(index);
    frames.entries[index].cap = cap;
    frames.from_untyped += 1;
    drop(frames);
    zero_frame(server, vaddr)?;
    Ok(vaddr)
}

fn zero_frame(server: &Arc<Server>, vaddr: Word) -> SosResult<()> {
    let mut kernel = server.kernel.lock();
    kernel
        .server_page_mut(vaddr, PAGE_SIZE)
        .map_err(SosError::from)?
        .fill(0);
    Ok(())
}

/// Return a frame to the free list.
///
/// Freeing an entry that was never allocated is a broken invariant and
/// panics; freeing one that is already on the free list is an error.
pub fn frame_free(server: &Arc<Server>, vaddr: Word) -> SosResult<()> {
    let mut frames = server.frames.lock();
    let index = frames.vaddr_to_index(page_align(vaddr));
    let free_head = frames.free_head;
    let entry = &mut frames.entries[index];
    assert!(
        entry.cap != CAP_NULL,
        "freeing frame {vaddr:#x} which holds no capability"
    );
    if !entry.flags.contains(FrameFlags::VALID) {
        return Err(SosError::BadArgument);
    }
    entry.flags = FrameFlags::empty();
    entry.waiter = None;
    entry.next_index = free_head;
    frames.free_head = index as i32;
    Ok(())
}

/// Pin the frames backing `[uaddr, uaddr + size)`: mark them referenced and
/// exempt from eviction while a handler blocks on I/O against them.
pub fn pin_frames(server: &Arc<Server>, pid: Pid, uaddr: Word, size: usize) {
    walk_resident(server, pid, uaddr, size, |entry| {
        if entry.flags.contains(FrameFlags::SWAPPABLE) {
            entry.flags.insert(FrameFlags::REFERENCE);
            entry.flags.remove(FrameFlags::SWAPPABLE);
        }
    });
}

/// Undo [`pin_frames`].
pub fn unpin_frames(server: &Arc<Server>, pid: Pid, uaddr: Word, size: usize) {
    walk_resident(server, pid, uaddr, size, |entry| {
        entry.flags.insert(FrameFlags::SWAPPABLE);
    });
}

fn walk_resident(
    server: &Arc<Server>,
    pid: Pid,
    uaddr: Word,
    size: usize,
    mut f: impl FnMut(&mut FrameEntry),
) {
    if size == 0 {
        return;
    }
    let span = size + (uaddr - page_align(uaddr)) as usize;
    let mut offset = 0usize;
    while offset < span {
        let addr = page_align(uaddr).wrapping_add(offset as Word);
        if let Ok(Some(pte)) = vm::pte_read(server, pid, addr) {
            if pte.contains_flags(vm::PteFlags::VALID) && !pte.contains_flags(vm::PteFlags::SWAP) {
                let mut frames = server.frames.lock();
                let index = frames.vaddr_to_index(pte.frame_vaddr());
                let entry = &mut frames.entries[index];
                if entry.flags.contains(FrameFlags::VALID) {
                    f(entry);
                }
            }
        }
        offset += PAGE_SIZE;
    }
}

/// Evict one frame (second-chance) and return its server vaddr, now at the
/// head of the free list.
///
/// The victim's client mapping is removed before the blocking write so a
/// client touching the page during the write takes a fault and parks on the
/// `BEING_SWAPPED` marker; the write itself goes through the server-side
/// mapping and is unaffected. Panics if no frame is evictable while memory
/// is exhausted, or if the swap write fails: both are unrecoverable.
pub fn swap_out(server: &Arc<Server>) -> SosResult<Word> {
    // Select a victim under the lock, and take it out of circulation so an
    // overlapping eviction cannot choose it again.
    let (victim_vaddr, app) = {
        let mut frames = server.frames.lock();
        let n = frames.entries.len();
        let mut chosen = None;
        for step in 0..2 * n {
            let i = (frames.victim + step) % n;
            let flags = frames.entries[i].flags;
            if !flags.contains(FrameFlags::VALID) || !flags.contains(FrameFlags::SWAPPABLE) {
                continue;
            }
            if flags.contains(FrameFlags::REFERENCE) {
                frames.entries[i].flags.remove(FrameFlags::REFERENCE);
            } else {
                chosen = Some(i);
                break;
            }
        }
        let victim = chosen.expect("memory exhausted with no evictable frame");
        frames.victim = (victim + 1) % n;
        frames.entries[victim].flags.remove(FrameFlags::SWAPPABLE);
        let vaddr = frames.index_to_vaddr(victim);
        let app = frames.entries[victim]
            .app_cap
            .take()
            .expect("evictable frame with no application capability");
        (vaddr, app)
    };

    log::debug!(
        "evicting frame {victim_vaddr:#x} (pid {} uaddr {:#x})",
        app.pid,
        app.uaddr
    );

    // Unmap from the client and mark the PTE so a fault on this page waits
    // for the eviction instead of racing it.
    vm::pte_update(server, app.pid, app.uaddr, |pte| {
        pte.with_flags(vm::PteFlags::BEING_SWAPPED)
    })?;
    {
        let mut kernel = server.kernel.lock();
        let _ = kernel.page_unmap(app.cap);
        let _ = kernel.cap_delete(app.cap);
    }

    let slot = crate::swap::get_swap_index(server)?;

    // Blocking write; other coroutines run here. Even if our own process
    // died in the meantime, the eviction's bookkeeping must complete so
    // neither the frame nor the swap slot leaks.
    let mut uio = Uio::new(UioTarget::Server { vaddr: victim_vaddr }, PAGE_SIZE, u64::from(slot) * PAGE_SIZE as u64);
    let cancelled = match server.swap_vnode().write(server, &mut uio) {
        Ok(()) => false,
        Err(SosError::Cancelled) => true,
        Err(err) => panic!("writing to the swap file failed: {err}"),
    };

    // The victim's owner may also have died while the write was in
    // flight; its page tables are gone and the slot goes straight back.
    let post = if server.procs.lock().get(app.pid).is_none() {
        crate::swap::free_swap_index(server, slot)
    } else {
        vm::set_swapped_out(server, app.pid, app.uaddr, slot)
    };

    let (waiter, server_cap) = {
        let mut frames = server.frames.lock();
        frames.evictions += 1;
        let waiter = frames.entry_mut(victim_vaddr).waiter.take();
        (waiter, frames.cap_of(victim_vaddr))
    };
    frame_free(server, victim_vaddr)?;
    server.kernel.lock().page_unify(server_cap);
    if let Some(id) = waiter {
        server.sched.set_resume(id);
    }
    if cancelled {
        return Err(SosError::Cancelled);
    }
    post?;
    Ok(victim_vaddr)
}

/// Read a page back from the swap file into a freshly allocated frame and
/// release its slot. Called from the fault path after the new frame is
/// mapped.
pub fn swap_in(server: &Arc<Server>, frame_vaddr: Word, slot: Word) -> SosResult<()> {
    let mut uio = Uio::new(
        UioTarget::Server {
            vaddr: page_align(frame_vaddr),
        },
        PAGE_SIZE,
        u64::from(slot) * PAGE_SIZE as u64,
    );
    // A cancelled read still releases the slot: the PTE no longer carries
    // SWAP, so the dying owner's teardown frees the frame but cannot see
    // the slot.
    let read = server.swap_vnode().read(server, &mut uio);
    let freed = crate::swap::free_swap_index(server, slot);
    read?;
    freed?;
    let server_cap = server.frames.lock().cap_of(frame_vaddr);
    server.kernel.lock().page_unify(server_cap);
    Ok(())
}
