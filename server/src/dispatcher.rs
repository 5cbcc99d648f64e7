//! The main loop: wait on the endpoint, route each message.
//!
//! Every iteration performs pending coroutine cleanup, then the pending
//! resume, then one endpoint wait. Interrupts (badge high bit) fan out to
//! the serial, timer and disk handlers; faults and syscalls each start a
//! coroutine with the reply capability saved up front.

use std::sync::Arc;

use sos_kernel_model::{
    Message, ReplyCap, IRQ_BADGE_DISK, IRQ_BADGE_SERIAL, IRQ_BADGE_TIMER, IRQ_EP_BADGE,
    LABEL_SYSCALL, LABEL_VM_FAULT,
};

use crate::clock;
use crate::coroutine::RunState;
use crate::error::SosError;
use crate::frame;
use crate::layout::{page_align, PAGE_SIZE};
use crate::proc::{self, Pid, ProcState};
use crate::server::Server;
use crate::syscall;
use crate::vm;

/// Serve until the endpoint is idle and no coroutine work is pending.
/// The hosted equivalent of the endless syscall loop: the driver enqueues
/// messages, then lets this drain them.
pub fn run_pending(server: &Arc<Server>) {
    loop {
        server.sched.cleanup();
        if let Some(id) = server.sched.take_resume() {
            resume_coroutine(server, id);
            continue;
        }
        let msg = {
            let mut kernel = server.kernel.lock();
            match kernel.wait(server.endpoint()) {
                Ok(msg) => msg,
                Err(err) => {
                    log::error!("endpoint wait failed: {err}");
                    return;
                }
            }
        };
        match msg {
            // The loop head just drained cleanup and the resume latch, so
            // an idle endpoint means nothing is left to do.
            Some(msg) => route(server, msg),
            None => return,
        }
    }
}

/// Drive the endpoint until a specific coroutine has finished; used for
/// boot-time process creation, which must be able to suspend on I/O
/// before the main loop exists.
pub fn drive_to_completion(server: &Arc<Server>, id: usize) {
    // An idle endpoint with the coroutine still parked means a lost
    // wakeup; that is a server bug, so give up loudly.
    for _ in 0..10_000 {
        run_pending(server);
        if !server.sched.is_suspended(id) {
            return;
        }
    }
    panic!("boot-time coroutine {id} made no progress");
}

fn resume_coroutine(server: &Arc<Server>, id: usize) {
    if server.sched.resume(id).is_none() {
        log::trace!("stale resume for coroutine {id}");
    }
}

fn route(server: &Arc<Server>, msg: Message) {
    if msg.badge & IRQ_EP_BADGE != 0 {
        if msg.badge & IRQ_BADGE_SERIAL != 0 {
            server.console.handle_irq(server);
        }
        if msg.badge & IRQ_BADGE_TIMER != 0 {
            clock::timer_interrupt(server);
        }
        if msg.badge & IRQ_BADGE_DISK != 0 {
            // Disk completions carry the waiting coroutine's id.
            server.sched.set_resume(msg.mr(0) as usize);
        }
        return;
    }

    let pid = msg.badge;
    match msg.label {
        LABEL_VM_FAULT => start_fault_handler(server, pid, msg),
        LABEL_SYSCALL => start_syscall_handler(server, pid, msg),
        other => {
            log::warn!("unknown message label {other} from badge {pid}");
            let saved = server.kernel.lock().save_reply_cap();
            if let Ok(reply) = saved {
                server.discard_reply(reply);
            }
        }
    }
}

fn save_reply(server: &Arc<Server>) -> Option<ReplyCap> {
    match server.kernel.lock().save_reply_cap() {
        Ok(reply) => Some(reply),
        Err(err) => {
            log::error!("saving reply capability: {err}");
            None
        }
    }
}

fn start_fault_handler(server: &Arc<Server>, pid: Pid, msg: Message) {
    let Some(reply) = save_reply(server) else { return };
    if server.procs.lock().get(pid).is_none() {
        log::warn!("fault from unknown pid {pid}");
        server.discard_reply(reply);
        return;
    }
    let task_server = server.me();
    let started = server.sched.start(Box::new(move || {
        fault_handler(&task_server, pid, reply, &msg);
    }));
    track_started(server, pid, reply, started);
}

/// Resolve a client VM fault: map the page, reply an empty message. A
/// client that faulted on memory the server cannot service is killed.
fn fault_handler(server: &Arc<Server>, pid: Pid, reply: ReplyCap, msg: &Message) {
    let instruction_vaddr = msg.mr(0);
    let is_instruction = msg.mr(2) != 0;
    let fault_vaddr = if is_instruction { msg.mr(0) } else { msg.mr(1) };
    log::debug!(
        "[pid {pid}] {} fault at {fault_vaddr:#x}",
        if is_instruction { "instruction" } else { "data" }
    );

    // On a data fault, keep the faulting instruction's page resident while
    // we may block in the pager.
    if !is_instruction {
        frame::pin_frames(server, pid, page_align(instruction_vaddr), PAGE_SIZE);
    }
    let result = vm::map_page(server, pid, fault_vaddr);
    if !is_instruction {
        frame::unpin_frames(server, pid, page_align(instruction_vaddr), PAGE_SIZE);
    }

    match result {
        Ok(_) => server.reply(reply, &[]),
        Err(SosError::Cancelled) => server.discard_reply(reply),
        Err(err) => {
            log::warn!("[pid {pid}] unserviceable fault at {fault_vaddr:#x}: {err}");
            server.discard_reply(reply);
            if let Err(err) = proc::process_destroy(server, pid) {
                log::error!("destroying faulting pid {pid}: {err}");
            }
        }
    }
    syscall::clear_coroutine_binding(server, pid);
}

fn start_syscall_handler(server: &Arc<Server>, pid: Pid, msg: Message) {
    let Some(reply) = save_reply(server) else { return };
    if server.procs.lock().get(pid).is_none() {
        log::warn!("syscall from unknown pid {pid}");
        server.discard_reply(reply);
        return;
    }
    let task_server = server.me();
    let started = server.sched.start(Box::new(move || {
        syscall::handle_syscall(&task_server, pid, reply, &msg);
    }));
    track_started(server, pid, reply, started);

    // A process that asked to delete itself is destroyed once its handler
    // has returned. The teardown can block on I/O, so it gets its own
    // coroutine.
    let self_destruct = server
        .procs
        .lock()
        .get(pid)
        .map(|pcb| pcb.state == ProcState::SelfDestruct)
        .unwrap_or(false);
    if self_destruct {
        let task_server = server.me();
        match server.sched.start(Box::new(move || {
            if let Err(err) = proc::process_destroy(&task_server, pid) {
                log::error!("self-destruct of pid {pid}: {err}");
            }
        })) {
            Ok(_) => {}
            Err(_) => log::error!("no coroutine slot to destroy pid {pid}"),
        }
    }
}

fn track_started(
    server: &Arc<Server>,
    pid: Pid,
    reply: ReplyCap,
    started: Result<(usize, RunState), Box<dyn FnOnce() + Send>>,
) {
    match started {
        Ok((id, RunState::Suspended)) => {
            if let Some(pcb) = server.procs.lock().get_mut(pid) {
                pcb.coroutine_id = Some(id);
            }
        }
        Ok((id, RunState::Done)) => {
            if let Some(pcb) = server.procs.lock().get_mut(pid) {
                if pcb.coroutine_id == Some(id) {
                    pcb.coroutine_id = None;
                }
            }
        }
        Err(task) => {
            // Out of coroutine slots: drop the request and free its reply
            // capability (the closure held a copy, which dies with it).
            drop(task);
            server.discard_reply(reply);
            log::warn!("coroutine pool exhausted; dropping request from pid {pid}");
        }
    }
}
