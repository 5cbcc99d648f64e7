//! Untyped memory and retype.
//!
//! Untyped memory is modelled as a watermark over the physical window; the
//! server retypes it into frames, page tables, page directories, TCBs and
//! endpoints. Frames get real backing in the arena so page contents survive
//! mapping, eviction and swap-in.

use crate::{
    CPtr, KernelError, KernelModel, Object, Result, Word, PAGE_BITS, PAGE_MASK, PAGE_SIZE,
};

/// Kernel object kinds the server can retype untyped memory into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Frame,
    PageTable,
    PageDirectory,
    Tcb,
    Endpoint,
}

impl ObjectType {
    /// Size of the backing object in bits, as retype consumes it.
    pub fn size_bits(self) -> Word {
        match self {
            ObjectType::Frame | ObjectType::PageTable | ObjectType::PageDirectory => PAGE_BITS,
            ObjectType::Tcb => 10,
            ObjectType::Endpoint => 4,
        }
    }
}

impl KernelModel {
    /// Allocate `2^size_bits` bytes of untyped memory, naturally aligned.
    pub fn ut_alloc(&mut self, size_bits: Word) -> Result<Word> {
        let size = 1u32 << size_bits;
        let base = (self.ut_next + size - 1) & !(size - 1);
        let end = base.checked_add(size).ok_or(KernelError::OutOfMemory {
            requested: size as usize,
        })?;
        if end > self.high {
            return Err(KernelError::OutOfMemory {
                requested: size as usize,
            });
        }
        self.ut_next = end;
        Ok(base)
    }

    /// Return untyped memory. The watermark allocator only accounts for it;
    /// the bytes are not reissued.
    pub fn ut_free(&mut self, _paddr: Word, size_bits: Word) {
        self.ut_returned += 1usize << size_bits;
    }

    /// Permanently reserve `bytes` from the low end of the window (frame
    /// table storage, DMA pools). Must run before any other allocation.
    pub fn ut_steal(&mut self, bytes: usize) -> Result<Word> {
        let base = self.ut_next;
        let end = base
            .checked_add(((bytes + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)) as Word)
            .ok_or(KernelError::OutOfMemory { requested: bytes })?;
        if end > self.high {
            return Err(KernelError::OutOfMemory { requested: bytes });
        }
        self.ut_next = end;
        Ok(base)
    }

    /// Retype untyped memory at `paddr` into a kernel object, returning a
    /// capability to it. Frame memory is zeroed.
    pub fn untyped_retype(&mut self, paddr: Word, ty: ObjectType) -> Result<CPtr> {
        match ty {
            ObjectType::Frame => {
                let page = self.page_index(paddr)?;
                let off = page * PAGE_SIZE;
                self.arena[off..off + PAGE_SIZE].fill(0);
                self.install(Object::Frame { page })
            }
            ObjectType::PageTable => self.install(Object::PageTable),
            ObjectType::PageDirectory => {
                let vs = self.vspaces.len();
                self.vspaces.push(crate::VSpace::new());
                self.install(Object::PageDirectory { vs })
            }
            ObjectType::Tcb => {
                let id = self.tcbs.len();
                self.tcbs.push(crate::Tcb::new());
                self.install(Object::Tcb { id })
            }
            ObjectType::Endpoint => {
                let ep = self.endpoints.len();
                self.endpoints.push(Default::default());
                self.install(Object::Endpoint { ep, badge: None })
            }
        }
    }

    pub(crate) fn page_index(&self, paddr: Word) -> Result<usize> {
        if paddr < self.low || paddr >= self.high || paddr & PAGE_MASK != 0 {
            return Err(KernelError::InvalidCap);
        }
        Ok(((paddr - self.low) as usize) >> PAGE_BITS)
    }

    pub(crate) fn page_bytes(&self, page: usize) -> &[u8] {
        let off = page * PAGE_SIZE;
        &self.arena[off..off + PAGE_SIZE]
    }

    pub(crate) fn page_bytes_mut(&mut self, page: usize) -> &mut [u8] {
        let off = page * PAGE_SIZE;
        &mut self.arena[off..off + PAGE_SIZE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ut_alloc_exhaustion() {
        let mut model = KernelModel::new(0x1000_0000, 0x1000_3000);
        assert!(model.ut_alloc(PAGE_BITS).is_ok());
        assert!(model.ut_alloc(PAGE_BITS).is_ok());
        assert!(model.ut_alloc(PAGE_BITS).is_ok());
        assert_eq!(
            model.ut_alloc(PAGE_BITS),
            Err(KernelError::OutOfMemory {
                requested: PAGE_SIZE
            })
        );
    }

    #[test]
    fn test_retype_zeroes_frames() {
        let mut model = KernelModel::new(0x1000_0000, 0x1004_0000);
        let paddr = model.ut_alloc(PAGE_BITS).unwrap();
        let cap = model.untyped_retype(paddr, ObjectType::Frame).unwrap();
        let page = match model.slot(cap).unwrap().obj {
            Object::Frame { page } => page,
            _ => unreachable!(),
        };
        assert!(model.page_bytes(page).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_ut_steal_moves_watermark() {
        let mut model = KernelModel::new(0x1000_0000, 0x1004_0000);
        let stolen = model.ut_steal(3 * PAGE_SIZE).unwrap();
        let next = model.ut_alloc(PAGE_BITS).unwrap();
        assert_eq!(next, stolen + 3 * PAGE_SIZE as Word);
    }
}
