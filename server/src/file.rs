//! The global open-file table.
//!
//! One fixed-size array of `(vnode, mode, offset, ref_count)` entries
//! shared by every process; per-process descriptor tables point into it by
//! index. Reference counts track descriptor-table slots across all
//! processes, and the vnode is closed when the last one goes away.

use std::sync::Arc;

use crate::server::Server;
use crate::vfs::{Fmode, Vnode};

pub const MAX_OPEN_FILES: usize = 64;
pub const PROCESS_MAX_FILES: usize = 16;

/// Descriptor numbers pre-wired at process creation.
pub const STDOUT_FD: usize = 1;
pub const STDERR_FD: usize = 2;
/// Open-file entry seeded with the console at boot.
pub const CONSOLE_OFD: usize = 0;

pub struct OftEntry {
    pub vnode: Option<Arc<dyn Vnode>>,
    pub mode: Fmode,
    pub offset: u64,
    pub ref_count: u32,
}

impl OftEntry {
    const fn free() -> Self {
        Self {
            vnode: None,
            mode: Fmode::empty(),
            offset: 0,
            ref_count: 0,
        }
    }
}

pub struct OpenFileTable {
    entries: Vec<OftEntry>,
    open_count: usize,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            entries: (0..MAX_OPEN_FILES).map(|_| OftEntry::free()).collect(),
            open_count: 0,
        }
    }

    /// Claim a free slot for an opened vnode, with one reference.
    pub fn alloc(&mut self, vnode: Arc<dyn Vnode>, mode: Fmode) -> Option<usize> {
        let ofd = self.entries.iter().position(|e| e.vnode.is_none())?;
        self.entries[ofd] = OftEntry {
            vnode: Some(vnode),
            mode,
            offset: 0,
            ref_count: 1,
        };
        self.open_count += 1;
        Some(ofd)
    }

    /// Seed a well-known slot at boot (the console). Keeps one server-side
    /// reference so the slot never drains.
    pub fn seed(&mut self, ofd: usize, vnode: Arc<dyn Vnode>, mode: Fmode) {
        self.entries[ofd] = OftEntry {
            vnode: Some(vnode),
            mode,
            offset: 0,
            ref_count: 1,
        };
        self.open_count += 1;
    }

    pub fn entry(&self, ofd: usize) -> Option<&OftEntry> {
        self.entries.get(ofd).filter(|e| e.vnode.is_some())
    }

    pub fn entry_mut(&mut self, ofd: usize) -> Option<&mut OftEntry> {
        self.entries.get_mut(ofd).filter(|e| e.vnode.is_some())
    }

    pub fn add_ref(&mut self, ofd: usize, count: u32) {
        if let Some(e) = self.entry_mut(ofd) {
            e.ref_count += count;
        }
    }

    pub fn is_full(&self) -> bool {
        self.open_count == MAX_OPEN_FILES
    }

    pub fn ref_count(&self, ofd: usize) -> u32 {
        self.entry(ofd).map(|e| e.ref_count).unwrap_or(0)
    }
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop one reference to an open-file entry, closing the vnode when the
/// count reaches zero. The table lock is released before the close runs.
pub fn release(server: &Arc<Server>, ofd: usize) {
    let closed = {
        let mut oft = server.oft.lock();
        let Some(entry) = oft.entry_mut(ofd) else {
            return;
        };
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            let vnode = entry.vnode.take();
            let mode = entry.mode;
            entry.mode = Fmode::empty();
            entry.offset = 0;
            oft.open_count -= 1;
            vnode.map(|v| (v, mode))
        } else {
            None
        }
    };
    if let Some((vnode, mode)) = closed {
        if let Err(err) = vnode.close(server, mode) {
            log::warn!("closing vnode behind ofd {ofd}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullVnode;
    impl Vnode for NullVnode {}

    #[test]
    fn test_alloc_and_refcount() {
        let mut oft = OpenFileTable::new();
        let v: Arc<dyn Vnode> = Arc::new(NullVnode);
        let ofd = oft.alloc(Arc::clone(&v), Fmode::READ).unwrap();
        assert_eq!(oft.ref_count(ofd), 1);
        oft.add_ref(ofd, 2);
        assert_eq!(oft.ref_count(ofd), 3);
    }

    #[test]
    fn test_table_fills_up() {
        let mut oft = OpenFileTable::new();
        for _ in 0..MAX_OPEN_FILES {
            let v: Arc<dyn Vnode> = Arc::new(NullVnode);
            assert!(oft.alloc(v, Fmode::READ).is_some());
        }
        assert!(oft.is_full());
        let v: Arc<dyn Vnode> = Arc::new(NullVnode);
        assert!(oft.alloc(v, Fmode::READ).is_none());
    }
}
