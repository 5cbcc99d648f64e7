//! Per-process virtual address spaces.
//!
//! Each process owns a region list and a software two-level page table: a
//! root page of 1024 entries, each naming a leaf page of 1024 entries, with
//! a parallel swap-table shadow of the same shape. All four kinds of table
//! page are unswappable frames; entries are little-endian words read and
//! written through the server window.

pub mod usercopy;

use std::sync::Arc;

use sos_kernel_model::{KernelError, ObjectType, Rights, Word, PAGE_BITS};

use crate::coroutine::CoroutinePool;
use crate::error::{SosError, SosResult};
use crate::file;
use crate::frame;
use crate::layout::{
    page_align, PAGE_MASK, PROCESS_HEAP_END, PROCESS_HEAP_START, PROCESS_IPC_BUFFER,
};
use crate::proc::Pid;
use crate::server::Server;

pub const TABLE_ENTRIES: usize = 1024;

bitflags::bitflags! {
    /// Permission bits attached to a region and echoed into its PTEs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionRights: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl RegionRights {
    pub fn to_map_rights(self) -> Rights {
        let mut rights = Rights::empty();
        if self.contains(RegionRights::READ) {
            rights |= Rights::READ;
        }
        if self.contains(RegionRights::WRITE) {
            rights |= Rights::WRITE;
        }
        rights
    }
}

bitflags::bitflags! {
    /// Low bits of a page-table entry; the upper bits hold the page-aligned
    /// server vaddr of the backing frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const VALID         = 1 << 0;
        /// Contents live in the swap file; the slot is in the shadow table.
        const SWAP          = 1 << 1;
        /// An eviction of this page is in flight.
        const BEING_SWAPPED = 1 << 2;
        const READABLE      = 1 << 3;
        const WRITABLE      = 1 << 4;
    }
}

const PTE_FLAG_MASK: Word = 0x1F;

/// One 32-bit software page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(pub Word);

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    pub fn new(frame_vaddr: Word, flags: PteFlags) -> Self {
        Pte(page_align(frame_vaddr) | flags.bits())
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & PTE_FLAG_MASK)
    }

    pub fn contains_flags(self, flags: PteFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Server vaddr of the backing frame; meaningless when SWAP is set.
    pub fn frame_vaddr(self) -> Word {
        self.0 & !PTE_FLAG_MASK & !PAGE_MASK
    }

    pub fn with_flags(self, flags: PteFlags) -> Self {
        Pte(self.0 | flags.bits())
    }

    pub fn without_flags(self, flags: PteFlags) -> Self {
        Pte(self.0 & !flags.bits())
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn perm_flags(self) -> PteFlags {
        self.flags() & (PteFlags::READABLE | PteFlags::WRITABLE)
    }
}

fn perm_bits(perms: RegionRights) -> PteFlags {
    let mut flags = PteFlags::empty();
    if perms.contains(RegionRights::READ) {
        flags |= PteFlags::READABLE;
    }
    if perms.contains(RegionRights::WRITE) {
        flags |= PteFlags::WRITABLE;
    }
    flags
}

/// Half-open client virtual range with fixed permissions.
#[derive(Debug, Clone)]
pub struct Region {
    pub base: Word,
    pub size: Word,
    pub perms: RegionRights,
}

impl Region {
    pub fn contains(&self, uaddr: Word) -> bool {
        uaddr >= self.base && u64::from(uaddr) < u64::from(self.base) + u64::from(self.size)
    }
}

/// Per-process address space.
pub struct AddressSpace {
    pub regions: Vec<Region>,
    /// Root page-table page (server vaddr), 0 until first mapping.
    pub pt_root: Word,
    /// Root of the parallel swap-table shadow.
    pub swap_root: Word,
    pub page_count: u32,
    pub fd_table: [i32; file::PROCESS_MAX_FILES],
    pub fd_count: usize,
}

impl AddressSpace {
    /// Fresh address space with stdout and stderr wired to the console's
    /// open-file entry. The caller bumps that entry's reference count.
    pub fn new() -> Self {
        let mut fd_table = [-1i32; file::PROCESS_MAX_FILES];
        fd_table[file::STDOUT_FD] = file::CONSOLE_OFD as i32;
        fd_table[file::STDERR_FD] = file::CONSOLE_OFD as i32;
        Self {
            regions: Vec::new(),
            pt_root: 0,
            swap_root: 0,
            page_count: 0,
            fd_table,
            fd_count: 2,
        }
    }

    /// Prepend a region. Zero-sized regions are allowed (the empty heap);
    /// callers guarantee non-overlap.
    pub fn define_region(&mut self, base: Word, size: Word, perms: RegionRights) {
        log::debug!("region defined: {base:#x} - {:#x}", base.wrapping_add(size));
        self.regions.insert(0, Region { base, size, perms });
    }

    pub fn find_region(&self, uaddr: Word) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(uaddr))
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
pub fn root_index(uaddr: Word) -> usize {
    (uaddr >> 22) as usize
}

#[inline]
pub fn leaf_index(uaddr: Word) -> usize {
    ((uaddr << 10) >> 22) as usize
}

fn table_entry(server: &Server, table_vaddr: Word, index: usize) -> SosResult<Word> {
    let kernel = server.kernel.lock();
    let bytes = kernel.server_page(table_vaddr + (index as Word) * 4, 4)?;
    Ok(Word::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn set_table_entry(server: &Server, table_vaddr: Word, index: usize, value: Word) -> SosResult<()> {
    let mut kernel = server.kernel.lock();
    kernel
        .server_page_mut(table_vaddr + (index as Word) * 4, 4)?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn roots(server: &Server, pid: Pid) -> SosResult<(Word, Word)> {
    let procs = server.procs.lock();
    let pcb = procs.get(pid).ok_or(SosError::NotFound)?;
    Ok((pcb.addrspace.pt_root, pcb.addrspace.swap_root))
}

/// Read the PTE for a client address; `None` when no table covers it.
pub fn pte_read(server: &Server, pid: Pid, uaddr: Word) -> SosResult<Option<Pte>> {
    let (root, _) = roots(server, pid)?;
    if root == 0 {
        return Ok(None);
    }
    let leaf = table_entry(server, root, root_index(uaddr))?;
    if leaf == 0 {
        return Ok(None);
    }
    Ok(Some(Pte(table_entry(server, leaf, leaf_index(uaddr))?)))
}

/// Overwrite the PTE for a client address; the covering tables must exist.
pub fn pte_write(server: &Server, pid: Pid, uaddr: Word, pte: Pte) -> SosResult<()> {
    let (root, _) = roots(server, pid)?;
    if root == 0 {
        return Err(SosError::InvalidAddr);
    }
    let leaf = table_entry(server, root, root_index(uaddr))?;
    if leaf == 0 {
        return Err(SosError::InvalidAddr);
    }
    set_table_entry(server, leaf, leaf_index(uaddr), pte.0)
}

/// Apply `f` to the PTE for a client address and store the result.
pub fn pte_update(server: &Server, pid: Pid, uaddr: Word, f: impl FnOnce(Pte) -> Pte) -> SosResult<Pte> {
    let old = pte_read(server, pid, uaddr)?.ok_or(SosError::InvalidAddr)?;
    let new = f(old);
    pte_write(server, pid, uaddr, new)?;
    Ok(new)
}

/// Swap-slot shadow entry for a client address.
pub fn swap_slot_read(server: &Server, pid: Pid, uaddr: Word) -> SosResult<Word> {
    let (_, sroot) = roots(server, pid)?;
    if sroot == 0 {
        return Err(SosError::InvalidAddr);
    }
    let sleaf = table_entry(server, sroot, root_index(uaddr))?;
    if sleaf == 0 {
        return Err(SosError::InvalidAddr);
    }
    table_entry(server, sleaf, leaf_index(uaddr))
}

/// Finalise an eviction: the PTE keeps its permission bits, gains SWAP,
/// loses its frame address and the BEING_SWAPPED marker; the shadow records
/// the slot.
pub fn set_swapped_out(server: &Server, pid: Pid, uaddr: Word, slot: Word) -> SosResult<()> {
    let (_, sroot) = roots(server, pid)?;
    let sleaf = table_entry(server, sroot, root_index(uaddr))?;
    set_table_entry(server, sleaf, leaf_index(uaddr), slot)?;
    pte_update(server, pid, uaddr, |pte| {
        Pte::new(0, pte.perm_flags() | PteFlags::VALID | PteFlags::SWAP)
    })?;
    Ok(())
}

/// Allocate the root/leaf table pages covering `uaddr`, lazily and
/// unswappably, rolling back partial work on failure.
fn ensure_tables(server: &Arc<Server>, pid: Pid, uaddr: Word) -> SosResult<()> {
    let mut fresh_root = false;
    let (root, _) = roots(server, pid)?;
    if root == 0 {
        let pt = frame::unswappable_alloc(server).map_err(no_memory)?;
        let st = match frame::unswappable_alloc(server) {
            Ok(v) => v,
            Err(e) => {
                frame::frame_free(server, pt)?;
                return Err(no_memory(e));
            }
        };
        // The allocations can suspend; another fault may have installed
        // roots in the meantime.
        let mut procs = server.procs.lock();
        let pcb = procs.get_mut(pid).ok_or(SosError::Cancelled)?;
        if pcb.addrspace.pt_root == 0 {
            pcb.addrspace.pt_root = pt;
            pcb.addrspace.swap_root = st;
            fresh_root = true;
        } else {
            drop(procs);
            frame::frame_free(server, pt)?;
            frame::frame_free(server, st)?;
        }
    }

    let (root, sroot) = roots(server, pid)?;
    let i1 = root_index(uaddr);
    if table_entry(server, root, i1)? != 0 {
        return Ok(());
    }
    let installed = (|| {
        let leaf = frame::unswappable_alloc(server).map_err(no_memory)?;
        let sleaf = match frame::unswappable_alloc(server) {
            Ok(v) => v,
            Err(e) => {
                frame::frame_free(server, leaf)?;
                return Err(no_memory(e));
            }
        };
        // Re-check after the potential suspension inside the allocations.
        if table_entry(server, root, i1)? != 0 {
            frame::frame_free(server, leaf)?;
            frame::frame_free(server, sleaf)?;
            return Ok(());
        }
        set_table_entry(server, root, i1, leaf)?;
        set_table_entry(server, sroot, i1, sleaf)?;
        Ok(())
    })();
    if installed.is_err() && fresh_root {
        // Nothing else claimed the fresh root while we failed; take the
        // whole partial structure back down.
        let mut procs = server.procs.lock();
        if let Some(pcb) = procs.get_mut(pid) {
            if pcb.addrspace.pt_root == root {
                pcb.addrspace.pt_root = 0;
                pcb.addrspace.swap_root = 0;
                drop(procs);
                frame::frame_free(server, root)?;
                frame::frame_free(server, sroot)?;
            }
        }
    }
    installed
}

fn no_memory(err: SosError) -> SosError {
    match err {
        SosError::Cancelled => SosError::Cancelled,
        _ => SosError::NoMemory,
    }
}

/// Map a frame into the client's directory, creating the hardware page
/// table on a failed lookup, as the kernel interface requires.
fn map_into_client(server: &Server, frame_cap: sos_kernel_model::CPtr, vroot: sos_kernel_model::CPtr, uaddr: Word, rights: Rights) -> SosResult<()> {
    let mut kernel = server.kernel.lock();
    match kernel.page_map(frame_cap, vroot, uaddr, rights) {
        Ok(()) => Ok(()),
        Err(KernelError::FailedLookup) => {
            let pt_paddr = kernel.ut_alloc(PAGE_BITS).map_err(|_| SosError::NoMemory)?;
            let pt_cap = kernel
                .untyped_retype(pt_paddr, ObjectType::PageTable)
                .map_err(SosError::from)?;
            kernel
                .page_table_map(pt_cap, vroot, uaddr)
                .map_err(SosError::from)?;
            kernel
                .page_map(frame_cap, vroot, uaddr, rights)
                .map_err(SosError::from)
        }
        Err(e) => Err(e.into()),
    }
}

/// Resolve a client page fault: allocate and map a frame for `uaddr`,
/// swapping the old contents back in when the page had been evicted.
/// Returns the server vaddr of the backing frame.
pub fn map_page(server: &Arc<Server>, pid: Pid, uaddr_unaligned: Word) -> SosResult<Word> {
    let uaddr = page_align(uaddr_unaligned);
    if uaddr == 0 {
        return Err(SosError::InvalidAddr);
    }

    let (perms, vroot) = {
        let procs = server.procs.lock();
        let pcb = procs.get(pid).ok_or(SosError::NotFound)?;
        let region = pcb
            .addrspace
            .find_region(uaddr_unaligned)
            .ok_or(SosError::InvalidRegion)?;
        (region.perms, pcb.vroot_cap)
    };

    ensure_tables(server, pid, uaddr)?;

    if let Some(pte) = pte_read(server, pid, uaddr)? {
        if pte.contains_flags(PteFlags::VALID)
            && !pte.contains_flags(PteFlags::SWAP)
            && !pte.contains_flags(PteFlags::BEING_SWAPPED)
        {
            // A retry of a resolved fault is a caller bug.
            return Err(SosError::AlreadyMapped);
        }
    }

    // Pages at or above the IPC buffer must never be paged out.
    let frame_vaddr = if uaddr >= PROCESS_IPC_BUFFER {
        frame::unswappable_alloc(server)?
    } else {
        frame::frame_alloc(server)?
    };

    let copied_cap = {
        let frames = server.frames.lock();
        let cap = frames.cap_of(frame_vaddr);
        drop(frames);
        server.kernel.lock().cap_copy(cap).map_err(SosError::from)?
    };

    if let Err(err) = map_into_client(server, copied_cap, vroot, uaddr, perms.to_map_rights()) {
        log::warn!("mapping {uaddr:#x} for pid {pid} failed: {err}");
        let mut kernel = server.kernel.lock();
        let _ = kernel.cap_delete(copied_cap);
        drop(kernel);
        frame::frame_free(server, frame_vaddr)?;
        return Err(SosError::InternalMapError);
    }

    server
        .frames
        .lock()
        .insert_app_cap(frame_vaddr, copied_cap, pid, uaddr)?;

    // If an eviction of this page is still in flight, wait for it to
    // finish so the swap slot is recorded before we read it back.
    let mut pte = pte_read(server, pid, uaddr)?.unwrap_or(Pte::EMPTY);
    if pte.contains_flags(PteFlags::BEING_SWAPPED) {
        server
            .frames
            .lock()
            .set_waiter(pte.frame_vaddr(), CoroutinePool::current().expect("fault handler off coroutine"));
        CoroutinePool::yield_now()?;
        pte = pte_read(server, pid, uaddr)?.unwrap_or(Pte::EMPTY);
    }

    let prev = pte;
    pte_write(
        server,
        pid,
        uaddr,
        Pte::new(frame_vaddr, PteFlags::VALID | perm_bits(perms)),
    )?;

    if prev.contains_flags(PteFlags::SWAP) {
        let slot = swap_slot_read(server, pid, uaddr)?;
        frame::swap_in(server, frame_vaddr, slot)?;
    }

    let server_cap = server.frames.lock().cap_of(frame_vaddr);
    server.kernel.lock().page_unify(server_cap);

    if let Some(pcb) = server.procs.lock().get_mut(pid) {
        pcb.addrspace.page_count += 1;
    }
    Ok(frame_vaddr)
}

/// Remove a frame's client mapping: kernel unmap, capability delete, and
/// the application-capability record nulled.
pub fn unmap_page(server: &Server, frame_vaddr: Word) -> SosResult<()> {
    let app = server
        .frames
        .lock()
        .take_app_cap(page_align(frame_vaddr))
        .ok_or(SosError::BadArgument)?;
    let mut kernel = server.kernel.lock();
    kernel.page_unmap(app.cap).map_err(SosError::from)?;
    kernel.cap_delete(app.cap).map_err(SosError::from)?;
    Ok(())
}

/// Grow (or shrink) the heap region. The new break must stay inside the
/// heap window.
pub fn brk(server: &Server, pid: Pid, new_brk: Word) -> SosResult<()> {
    let mut procs = server.procs.lock();
    let pcb = procs.get_mut(pid).ok_or(SosError::NotFound)?;
    let region = pcb
        .addrspace
        .regions
        .iter_mut()
        .find(|r| r.base == PROCESS_HEAP_START)
        .ok_or(SosError::InvalidRegion)?;
    if !(PROCESS_HEAP_START..PROCESS_HEAP_END).contains(&new_brk) {
        return Err(SosError::BadArgument);
    }
    region.size = new_brk - PROCESS_HEAP_START;
    Ok(())
}

/// Tear down an address space: release swap slots, unmap and free resident
/// frames, free every table page, and drop open-file references.
///
/// The PCB has already left the process table; entries under an in-flight
/// eviction are skipped, the eviction owns their frame and slot.
pub fn destroy_addrspace(server: &Arc<Server>, addrspace: AddressSpace) -> SosResult<()> {
    if addrspace.pt_root != 0 {
        for i1 in 0..TABLE_ENTRIES {
            let leaf = table_entry(server, addrspace.pt_root, i1)?;
            if leaf == 0 {
                continue;
            }
            // The shadow leaf exists whenever the page-table leaf does.
            let sleaf = table_entry(server, addrspace.swap_root, i1)?;
            for i2 in 0..TABLE_ENTRIES {
                let pte = Pte(table_entry(server, leaf, i2)?);
                if !pte.contains_flags(PteFlags::VALID) {
                    continue;
                }
                if pte.contains_flags(PteFlags::BEING_SWAPPED) {
                    continue;
                }
                if pte.contains_flags(PteFlags::SWAP) {
                    let slot = table_entry(server, sleaf, i2)?;
                    crate::swap::free_swap_index(server, slot)?;
                } else {
                    let frame_vaddr = pte.frame_vaddr();
                    if let Err(err) = unmap_page(server, frame_vaddr) {
                        log::warn!("teardown unmap of {frame_vaddr:#x}: {err}");
                    }
                    frame::frame_free(server, frame_vaddr)?;
                    let server_cap = server.frames.lock().cap_of(frame_vaddr);
                    server.kernel.lock().page_unify(server_cap);
                }
            }
            frame::frame_free(server, leaf)?;
            frame::frame_free(server, sleaf)?;
        }
        frame::frame_free(server, addrspace.pt_root)?;
        frame::frame_free(server, addrspace.swap_root)?;
    }

    for &ofd in addrspace.fd_table.iter() {
        if ofd >= 0 {
            file::release(server, ofd as usize);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pte_packing() {
        let pte = Pte::new(0x3001_2000, PteFlags::VALID | PteFlags::WRITABLE);
        assert_eq!(pte.frame_vaddr(), 0x3001_2000);
        assert!(pte.contains_flags(PteFlags::VALID));
        assert!(pte.contains_flags(PteFlags::WRITABLE));
        assert!(!pte.contains_flags(PteFlags::SWAP));
    }

    #[test]
    fn test_indices_split_address() {
        let uaddr: Word = 0x8F40_3123;
        assert_eq!(root_index(uaddr), (0x8F40_3123u32 >> 22) as usize);
        assert_eq!(leaf_index(uaddr), ((0x8F40_3123u32 >> 12) & 0x3FF) as usize);
    }

    #[test]
    fn test_region_list_prepends() {
        let mut addrspace = AddressSpace::new();
        addrspace.define_region(0x1000, 0x1000, RegionRights::READ);
        addrspace.define_region(0x5000, 0, RegionRights::all());
        assert_eq!(addrspace.regions[0].base, 0x5000);
        assert!(addrspace.find_region(0x1fff).is_some());
        assert!(addrspace.find_region(0x2000).is_none());
        // Zero-sized regions contain nothing.
        assert!(addrspace.find_region(0x5000).is_none());
    }
}
