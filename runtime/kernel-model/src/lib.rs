//! Kernel model - an in-process stand-in for the capability microkernel
//!
//! # Purpose
//! The SOS server consumes a small set of kernel primitives: untyped-memory
//! allocation, capability retype/copy/mint/delete, page mapping and
//! unmapping, TCB control, and synchronous IPC over a badged endpoint. This
//! crate models those primitives faithfully enough that the whole server,
//! including its paging and swap engine, runs and is testable on any
//! development host.
//!
//! # Integration Points
//! - Depends on: nothing outside the workspace
//! - Provides to: the SOS server and its integration tests
//!
//! # Architecture
//! One [`KernelModel`] value owns a byte arena standing in for the physical
//! memory window, a capability slot table, the kernel objects derived from
//! untyped memory (frames, page directories, page tables, TCBs, endpoints),
//! and the server's IPC endpoint. Frames have real 4 KiB backing, so page
//! contents written through one mapping are observable through another.
//! Client-side loads and stores go through [`KernelModel::client_read`] /
//! [`KernelModel::client_write`], which fail with a [`VmFault`] exactly
//! where the MMU would; the caller queues the fault message and retries
//! once the server has handled it.
//!
//! # Testing Strategy
//! - Unit tests: slot lifecycle, retype budget, mapping rules, fault shapes
//! - The server's integration tests drive everything else

mod devices;
mod ipc;
mod memory;
mod objects;
mod tcb;
mod vspace;

pub use ipc::{Message, ReplyCap};
pub use memory::ObjectType;
pub use vspace::VmFault;

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

/// Machine word: the modelled kernel is 32-bit.
pub type Word = u32;

/// Capability pointer: an index into the server's capability space.
pub type CPtr = Word;

/// The null capability.
pub const CAP_NULL: CPtr = 0;

pub const PAGE_BITS: Word = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;
pub const PAGE_MASK: Word = (PAGE_SIZE as Word) - 1;

/// Span of client address space covered by one second-level table.
pub const TABLE_SPAN_BITS: Word = 22;

/// Align an address down to its page.
#[inline]
pub fn page_align(addr: Word) -> Word {
    addr & !PAGE_MASK
}

/// Interrupt messages carry this bit in their badge; low bits identify the
/// source. Client messages carry the process id as the badge, so pids must
/// stay below the high bit.
pub const IRQ_EP_BADGE: Word = 1 << 31;
pub const IRQ_BADGE_SERIAL: Word = 1 << 0;
pub const IRQ_BADGE_TIMER: Word = 1 << 1;
pub const IRQ_BADGE_DISK: Word = 1 << 2;

/// Message label for a plain system call.
pub const LABEL_SYSCALL: Word = 0;
/// Message label for a virtual-memory fault.
pub const LABEL_VM_FAULT: Word = 1;

bitflags::bitflags! {
    /// Access rights on a page mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl Rights {
    pub const ALL: Rights = Rights::all();
}

/// Errors surfaced by kernel primitives.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KernelError {
    #[error("out of capability slots")]
    OutOfSlots,

    #[error("out of untyped memory (requested {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("invalid capability")]
    InvalidCap,

    #[error("no second-level table covers the address")]
    FailedLookup,

    #[error("a mapping already occupies the slot")]
    DeleteFirst,

    #[error("operation not supported on this object")]
    BadObject,
}

pub type Result<T> = core::result::Result<T, KernelError>;

pub(crate) use objects::{Object, Slot};
pub(crate) use tcb::Tcb;
pub(crate) use vspace::VSpace;

/// The modelled kernel.
///
/// Constructed once at boot with the physical window the server may manage.
/// All state a real kernel would keep on the server's behalf lives here.
pub struct KernelModel {
    low: Word,
    high: Word,
    arena: Vec<u8>,

    /// Untyped watermark: next unallocated physical address.
    ut_next: Word,
    /// Bytes handed back by `ut_free`; accounting only, the watermark does
    /// not move backwards.
    ut_returned: usize,

    slots: Vec<Option<Slot>>,
    vspaces: Vec<VSpace>,
    tcbs: Vec<Tcb>,

    /// The server's IPC endpoint queues, indexed by endpoint id.
    endpoints: Vec<VecDeque<Message>>,
    /// Endpoint interrupts are delivered to, once routed.
    irq_endpoint: Option<usize>,
    /// Badge and label of the last client call popped from an endpoint,
    /// until the server saves it as a reply capability.
    pending_reply: Option<(Word, Word)>,
    /// Replies delivered to clients, keyed by badge.
    mailboxes: HashMap<Word, VecDeque<Vec<Word>>>,

    serial_out: Vec<u8>,
    serial_in: VecDeque<u8>,

    now_us: u64,
    timer_deadline: Option<u64>,
}

impl KernelModel {
    /// Build a model managing the physical window `[low, high)`.
    ///
    /// Both bounds must be page aligned. The server's own page directory is
    /// pre-installed; its capability is [`KernelModel::server_pd`].
    pub fn new(low: Word, high: Word) -> Self {
        assert_eq!(low & PAGE_MASK, 0, "window base must be page aligned");
        assert_eq!(high & PAGE_MASK, 0, "window end must be page aligned");
        assert!(low < high);

        let mut model = Self {
            low,
            high,
            arena: vec![0; (high - low) as usize],
            ut_next: low,
            ut_returned: 0,
            slots: vec![None],
            vspaces: Vec::new(),
            tcbs: Vec::new(),
            endpoints: Vec::new(),
            irq_endpoint: None,
            pending_reply: None,
            mailboxes: HashMap::new(),
            serial_out: Vec::new(),
            serial_in: VecDeque::new(),
            now_us: 0,
            timer_deadline: None,
        };

        // Server vspace occupies id 0 and never faults: second-level tables
        // cover the whole window up front.
        let vs = VSpace::with_full_coverage();
        model.vspaces.push(vs);
        let pd = model
            .install(Object::PageDirectory { vs: 0 })
            .expect("fresh slot table");
        debug_assert_eq!(pd, 1);
        model
    }

    /// Capability to the server's own page directory.
    pub fn server_pd(&self) -> CPtr {
        1
    }

    /// The managed physical window.
    pub fn memory_window(&self) -> (Word, Word) {
        (self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_alignment_enforced() {
        let model = KernelModel::new(0x1000_0000, 0x1010_0000);
        assert_eq!(model.memory_window(), (0x1000_0000, 0x1010_0000));
    }

    #[test]
    #[should_panic]
    fn test_unaligned_window_rejected() {
        let _ = KernelModel::new(0x1000_0100, 0x1010_0000);
    }
}
