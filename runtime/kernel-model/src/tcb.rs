//! Thread control blocks for client processes.

use crate::{CPtr, KernelError, KernelModel, Object, Result, Word};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcbState {
    Inactive,
    Running,
    Suspended,
}

#[derive(Debug)]
pub(crate) struct Tcb {
    /// Badge of the fault endpoint this TCB was configured with; doubles as
    /// the client's identity.
    pub badge: Word,
    pub vspace: usize,
    pub ipc_buffer: Word,
    pub pc: Word,
    pub sp: Word,
    pub state: TcbState,
    pub live: bool,
}

impl Tcb {
    pub fn new() -> Self {
        Self {
            badge: 0,
            vspace: 0,
            ipc_buffer: 0,
            pc: 0,
            sp: 0,
            state: TcbState::Inactive,
            live: true,
        }
    }
}

impl KernelModel {
    fn tcb_id(&self, tcb_cap: CPtr) -> Result<usize> {
        match self.slot(tcb_cap)?.obj {
            Object::Tcb { id } => Ok(id),
            _ => Err(KernelError::BadObject),
        }
    }

    /// Configure a TCB: fault endpoint (badged), address space, IPC buffer.
    pub fn tcb_configure(
        &mut self,
        tcb_cap: CPtr,
        fault_ep_cap: CPtr,
        pd_cap: CPtr,
        ipc_buffer: Word,
    ) -> Result<()> {
        let badge = match self.slot(fault_ep_cap)?.obj {
            Object::Endpoint { badge: Some(b), .. } => b,
            _ => return Err(KernelError::BadObject),
        };
        let vs = match self.slot(pd_cap)?.obj {
            Object::PageDirectory { vs } => vs,
            _ => return Err(KernelError::BadObject),
        };
        let id = self.tcb_id(tcb_cap)?;
        let tcb = &mut self.tcbs[id];
        tcb.badge = badge;
        tcb.vspace = vs;
        tcb.ipc_buffer = ipc_buffer;
        Ok(())
    }

    /// Set the program counter and stack pointer.
    pub fn tcb_write_registers(&mut self, tcb_cap: CPtr, pc: Word, sp: Word) -> Result<()> {
        let id = self.tcb_id(tcb_cap)?;
        self.tcbs[id].pc = pc;
        self.tcbs[id].sp = sp;
        Ok(())
    }

    pub fn tcb_resume(&mut self, tcb_cap: CPtr) -> Result<()> {
        let id = self.tcb_id(tcb_cap)?;
        self.tcbs[id].state = TcbState::Running;
        Ok(())
    }

    pub fn tcb_suspend(&mut self, tcb_cap: CPtr) -> Result<()> {
        let id = self.tcb_id(tcb_cap)?;
        self.tcbs[id].state = TcbState::Suspended;
        Ok(())
    }

    /// Mark a TCB dead when its capability is destroyed so badge lookups no
    /// longer resolve to it.
    pub fn tcb_retire(&mut self, tcb_cap: CPtr) -> Result<()> {
        let id = self.tcb_id(tcb_cap)?;
        self.tcbs[id].live = false;
        Ok(())
    }

    pub(crate) fn tcb_by_badge(&self, badge: Word) -> Option<&Tcb> {
        self.tcbs.iter().rev().find(|t| t.live && t.badge == badge)
    }

    /// Registers of client `pid`, for tests inspecting where a process was
    /// started.
    pub fn client_registers(&self, pid: Word) -> Option<(Word, Word)> {
        self.tcb_by_badge(pid).map(|t| (t.pc, t.sp))
    }
}
