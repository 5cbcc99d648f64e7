//! Process table and lifecycle.
//!
//! A PCB arena indexed by pid holds every process's kernel handles,
//! address space, and wait bookkeeping. Creation builds the kernel
//! objects, the three fixed regions and the IPC buffer, loads the ELF
//! image, and starts the thread; destruction unwinds all of it and wakes a
//! waiting parent.

use std::sync::Arc;

use sos_kernel_model::{CPtr, ObjectType, Word, PAGE_BITS};

use crate::clock;
use crate::coroutine::CoroutinePool;
use crate::error::{SosError, SosResult};
use crate::file;
use crate::layout::{
    PROCESS_HEAP_START, PROCESS_IPC_BUFFER, PROCESS_STACK_BOT, PROCESS_STACK_TOP,
};
use crate::server::Server;
use crate::vfs::Fmode;
use crate::vfs::{Uio, UioTarget};
use crate::vm::{self, AddressSpace, RegionRights};

pub type Pid = Word;

pub const MAX_PROCESSES: usize = 32;

/// Argument to `process_wait` meaning "any child".
pub const WAIT_ANY: Word = Word::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    NotBusy,
    /// A delete-of-self syscall ran; the dispatcher destroys the process
    /// once the handler returns.
    SelfDestruct,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    None,
    Any,
    Pid(Pid),
}

pub struct Pcb {
    pub pid: Pid,
    /// Parent pid, -1 once orphaned.
    pub parent: i32,
    pub name: String,
    /// Start time, milliseconds since boot.
    pub stime_ms: u64,
    pub state: ProcState,
    pub wait: WaitTarget,
    /// Exited pid recorded for a woken waiter.
    pub wait_result: Option<Pid>,
    /// Coroutine currently working on this process's behalf.
    pub coroutine_id: Option<usize>,

    pub tcb_cap: CPtr,
    pub tcb_paddr: Word,
    pub vroot_cap: CPtr,
    pub vroot_paddr: Word,
    pub fault_ep_cap: CPtr,
    pub ipc_buffer_vaddr: Word,

    pub addrspace: AddressSpace,
}

pub struct ProcessTable {
    slots: Vec<Option<Pcb>>,
    /// When each slot was last freed; drives least-recently-freed reuse.
    end_time_ms: Vec<u64>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_PROCESSES).map(|_| None).collect(),
            end_time_ms: vec![0; MAX_PROCESSES],
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.slots.get(pid as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.slots.get_mut(pid as usize).and_then(|s| s.as_mut())
    }

    pub fn live_pids(&self) -> Vec<Pid> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as Pid)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Pick an empty slot, preferring the one freed longest ago
    /// (never-used slots rank as freed at boot and win ties by index).
    fn alloc_slot(&self) -> Option<Pid> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .min_by_key(|(i, _)| (self.end_time_ms[*i], *i))
            .map(|(i, _)| i as Pid)
    }

    fn insert(&mut self, pid: Pid, pcb: Pcb) {
        self.slots[pid as usize] = Some(pcb);
    }

    fn remove(&mut self, pid: Pid, now_ms: u64) -> Option<Pcb> {
        let pcb = self.slots.get_mut(pid as usize)?.take()?;
        self.end_time_ms[pid as usize] = now_ms;
        Some(pcb)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a process from a named image: the boot archive first, then the
/// file store (which requires the execute bit). Returns the new pid.
pub fn process_new(server: &Arc<Server>, name: &str, parent: i32) -> SosResult<Pid> {
    if let Some(image) = server.archive_lookup(name) {
        return create_process(server, name, &image, parent);
    }

    let vnode = server.vfs.open(server, name, Fmode::READ)?;
    let stat = vnode.stat(server)?;
    if !stat.fmode.contains(Fmode::EXEC) {
        return Err(SosError::BadArgument);
    }
    let mut image = vec![0u8; stat.size as usize];
    let mut uio = Uio::new(UioTarget::Buffer(&mut image), stat.size as usize, 0);
    vnode.read(server, &mut uio)?;
    if uio.remaining != 0 {
        return Err(SosError::IoError);
    }
    create_process(server, name, &image, parent)
}

fn create_process(server: &Arc<Server>, name: &str, image: &[u8], parent: i32) -> SosResult<Pid> {
    let pid = {
        let mut procs = server.procs.lock();
        let Some(pid) = procs.alloc_slot() else {
            return Err(SosError::NoMemory);
        };
        server.oft.lock().add_ref(file::CONSOLE_OFD, 2);
        let pcb = Pcb {
            pid,
            parent,
            name: name.to_string(),
            stime_ms: clock::time_stamp(server) / 1000,
            state: ProcState::NotBusy,
            wait: WaitTarget::None,
            wait_result: None,
            coroutine_id: None,
            tcb_cap: 0,
            tcb_paddr: 0,
            vroot_cap: 0,
            vroot_paddr: 0,
            fault_ep_cap: 0,
            ipc_buffer_vaddr: 0,
            addrspace: AddressSpace::new(),
        };
        procs.insert(pid, pcb);
        pid
    };

    match build_process(server, pid, image) {
        Ok(entry) => {
            let tcb_cap = {
                let procs = server.procs.lock();
                procs.get(pid).ok_or(SosError::Cancelled)?.tcb_cap
            };
            let mut kernel = server.kernel.lock();
            kernel
                .tcb_write_registers(tcb_cap, entry, PROCESS_STACK_TOP)
                .map_err(SosError::from)?;
            kernel.tcb_resume(tcb_cap).map_err(SosError::from)?;
            log::info!("started \"{name}\" as pid {pid}");
            Ok(pid)
        }
        Err(err) => {
            log::warn!("creating \"{name}\": {err}");
            let _ = process_destroy(server, pid);
            Err(err)
        }
    }
}

/// Kernel objects, regions, IPC buffer, image. Returns the entry point.
fn build_process(server: &Arc<Server>, pid: Pid, image: &[u8]) -> SosResult<Word> {
    // VSpace.
    let (vroot_paddr, vroot_cap, fault_ep_cap, tcb_paddr, tcb_cap) = {
        let mut kernel = server.kernel.lock();
        let vroot_paddr = kernel.ut_alloc(PAGE_BITS).map_err(|_| SosError::NoMemory)?;
        let vroot_cap = kernel
            .untyped_retype(vroot_paddr, ObjectType::PageDirectory)
            .map_err(SosError::from)?;
        // Badged fault endpoint: the badge is the pid.
        let fault_ep_cap = kernel
            .cap_mint(server.endpoint(), pid)
            .map_err(SosError::from)?;
        let tcb_paddr = kernel
            .ut_alloc(ObjectType::Tcb.size_bits())
            .map_err(|_| SosError::NoMemory)?;
        let tcb_cap = kernel
            .untyped_retype(tcb_paddr, ObjectType::Tcb)
            .map_err(SosError::from)?;
        (vroot_paddr, vroot_cap, fault_ep_cap, tcb_paddr, tcb_cap)
    };
    {
        let mut procs = server.procs.lock();
        let pcb = procs.get_mut(pid).ok_or(SosError::Cancelled)?;
        pcb.vroot_paddr = vroot_paddr;
        pcb.vroot_cap = vroot_cap;
        pcb.fault_ep_cap = fault_ep_cap;
        pcb.tcb_paddr = tcb_paddr;
        pcb.tcb_cap = tcb_cap;
        // IPC buffer region; mapped (unswappably) right below.
        pcb.addrspace
            .define_region(PROCESS_IPC_BUFFER, 1 << PAGE_BITS, RegionRights::all());
    }

    let ipc_buffer_vaddr = vm::map_page(server, pid, PROCESS_IPC_BUFFER)?;
    {
        let mut procs = server.procs.lock();
        let pcb = procs.get_mut(pid).ok_or(SosError::Cancelled)?;
        pcb.ipc_buffer_vaddr = ipc_buffer_vaddr;
    }
    server
        .kernel
        .lock()
        .tcb_configure(tcb_cap, fault_ep_cap, vroot_cap, PROCESS_IPC_BUFFER)
        .map_err(SosError::from)?;

    // Image segments first, then heap and stack.
    let entry = crate::elf::load(server, pid, image)?;

    {
        let mut procs = server.procs.lock();
        let pcb = procs.get_mut(pid).ok_or(SosError::Cancelled)?;
        pcb.addrspace
            .define_region(PROCESS_HEAP_START, 0, RegionRights::READ | RegionRights::WRITE);
        pcb.addrspace.define_region(
            PROCESS_STACK_BOT,
            PROCESS_STACK_TOP - PROCESS_STACK_BOT,
            RegionRights::READ | RegionRights::WRITE,
        );
    }
    Ok(entry)
}

/// Destroy a process: suspend it, orphan its children, wake a waiting
/// parent, tear down its address space and kernel objects, and cancel any
/// coroutine suspended on its behalf.
pub fn process_destroy(server: &Arc<Server>, pid: Pid) -> SosResult<()> {
    let now_ms = clock::time_stamp(server) / 1000;
    let (pcb, parent_resume) = {
        let mut procs = server.procs.lock();
        let Some(mut pcb) = procs.remove(pid, now_ms) else {
            return Err(SosError::NotFound);
        };
        pcb.state = ProcState::Destroyed;

        for other in procs.slots.iter_mut().flatten() {
            if other.parent == pid as i32 {
                other.parent = -1;
            }
        }

        let mut parent_resume = None;
        if pcb.parent >= 0 {
            if let Some(parent) = procs.get_mut(pcb.parent as Pid) {
                let woken = match parent.wait {
                    WaitTarget::Any => true,
                    WaitTarget::Pid(p) => p == pid,
                    WaitTarget::None => false,
                };
                if woken {
                    parent.wait = WaitTarget::None;
                    parent.wait_result = Some(pid);
                    parent_resume = parent.coroutine_id;
                }
            }
        }
        (pcb, parent_resume)
    };

    if pcb.tcb_cap != 0 {
        let _ = server.kernel.lock().tcb_suspend(pcb.tcb_cap);
    }
    if let Some(id) = parent_resume {
        server.sched.set_resume(id);
    }

    let Pcb {
        tcb_cap,
        tcb_paddr,
        vroot_cap,
        vroot_paddr,
        fault_ep_cap,
        coroutine_id,
        addrspace,
        ..
    } = pcb;

    vm::destroy_addrspace(server, addrspace)?;

    {
        let mut kernel = server.kernel.lock();
        if tcb_cap != 0 {
            let _ = kernel.tcb_retire(tcb_cap);
            let _ = kernel.cap_delete(tcb_cap);
            kernel.ut_free(tcb_paddr, ObjectType::Tcb.size_bits());
        }
        if vroot_cap != 0 {
            let _ = kernel.cap_delete(vroot_cap);
            kernel.ut_free(vroot_paddr, PAGE_BITS);
        }
        if fault_ep_cap != 0 {
            let _ = kernel.cap_delete(fault_ep_cap);
        }
    }

    if let Some(id) = coroutine_id {
        if CoroutinePool::current() != Some(id) {
            server.sched.cancel(id);
        }
    }

    log::info!("destroyed pid {pid}");
    Ok(())
}
