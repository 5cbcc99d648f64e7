//! The server endpoint: message queue, reply capabilities, interrupts, and
//! the client-side call path used by tests.

use crate::{
    CPtr, KernelError, KernelModel, Object, Result, VmFault, Word, IRQ_EP_BADGE, LABEL_SYSCALL,
    LABEL_VM_FAULT,
};

/// One message received from the endpoint.
#[derive(Debug, Clone)]
pub struct Message {
    pub badge: Word,
    pub label: Word,
    pub mrs: Vec<Word>,
}

impl Message {
    /// Message register `i`, or 0 when absent (matching hardware registers
    /// that simply hold stale values).
    pub fn mr(&self, i: usize) -> Word {
        self.mrs.get(i).copied().unwrap_or(0)
    }
}

/// Capability to reply to a client call. One-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyCap(pub CPtr);

impl KernelModel {
    fn endpoint_of(&self, ep_cap: CPtr) -> Result<usize> {
        match self.slot(ep_cap)?.obj {
            Object::Endpoint { ep, .. } => Ok(ep),
            _ => Err(KernelError::BadObject),
        }
    }

    /// Route device interrupts to the given endpoint. Stands in for minting
    /// badged interrupt capabilities and handing them to each driver.
    pub fn route_interrupts(&mut self, ep_cap: CPtr) -> Result<()> {
        self.irq_endpoint = Some(self.endpoint_of(ep_cap)?);
        Ok(())
    }

    /// Post an interrupt message: badge high bit plus the source bits.
    pub fn post_interrupt(&mut self, bits: Word, payload: Word) {
        let Some(ep) = self.irq_endpoint else {
            log::warn!("interrupt {:#x} raised before routing", bits);
            return;
        };
        self.endpoints[ep].push_back(Message {
            badge: IRQ_EP_BADGE | bits,
            label: 0,
            mrs: vec![payload],
        });
    }

    /// Wait on an endpoint. Returns `None` when the queue is idle (the real
    /// kernel would block the server here).
    pub fn wait(&mut self, ep_cap: CPtr) -> Result<Option<Message>> {
        let ep = self.endpoint_of(ep_cap)?;
        let msg = self.endpoints[ep].pop_front();
        if let Some(m) = &msg {
            if m.badge & IRQ_EP_BADGE == 0 {
                // A client call: its reply window opens now.
                self.pending_reply = Some((m.badge, m.label));
            }
        }
        Ok(msg)
    }

    /// Save the reply capability for the most recently received client
    /// call.
    pub fn save_reply_cap(&mut self) -> Result<ReplyCap> {
        let (badge, label) = self.pending_reply.take().ok_or(KernelError::InvalidCap)?;
        Ok(ReplyCap(self.install(Object::Reply {
            badge,
            fault: label == LABEL_VM_FAULT,
        })?))
    }

    /// Reply through a saved reply capability. The capability is consumed.
    /// A fault reply resumes the client's access; only syscall replies
    /// deliver data to the client's registers.
    pub fn reply(&mut self, cap: ReplyCap, mrs: &[Word]) -> Result<()> {
        let (badge, fault) = match self.slot(cap.0)?.obj {
            Object::Reply { badge, fault } => (badge, fault),
            _ => return Err(KernelError::BadObject),
        };
        if !fault {
            self.mailboxes.entry(badge).or_default().push_back(mrs.to_vec());
        }
        self.free_slot(cap.0);
        Ok(())
    }

    /// Discard a saved reply capability without answering.
    pub fn discard_reply(&mut self, cap: ReplyCap) {
        self.free_slot(cap.0);
    }

    // --- client driver -----------------------------------------------
    //
    // Tests play the client's user-mode stub: enqueue a call, run the
    // dispatcher, take the reply.

    /// Enqueue a system call from client `pid`.
    pub fn client_call(&mut self, pid: Word, mrs: &[Word]) {
        let Some(ep) = self.irq_endpoint else {
            panic!("client call before the server routed its endpoint");
        };
        self.endpoints[ep].push_back(Message {
            badge: pid,
            label: LABEL_SYSCALL,
            mrs: mrs.to_vec(),
        });
    }

    /// Enqueue the fault message a failed client access produced.
    pub fn client_fault(&mut self, pid: Word, fault: VmFault) {
        let Some(ep) = self.irq_endpoint else {
            panic!("client fault before the server routed its endpoint");
        };
        self.endpoints[ep].push_back(Message {
            badge: pid,
            label: LABEL_VM_FAULT,
            mrs: vec![fault.pc, fault.addr, 0],
        });
    }

    /// Take the oldest reply delivered to client `pid`, if any.
    pub fn take_reply(&mut self, pid: Word) -> Option<Vec<Word>> {
        self.mailboxes.get_mut(&pid).and_then(|q| q.pop_front())
    }
}
