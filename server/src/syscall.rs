//! System-call surface: argument validation, user-pointer copying, reply.
//!
//! Every handler runs on a coroutine with the reply capability saved by
//! the dispatcher. Illegal user input yields `-1` in the reply (there is
//! no errno channel). A handler whose process died while it was suspended
//! sees `Cancelled` and frees the reply capability instead of answering.

use std::sync::Arc;

use sos_kernel_model::{Message, ReplyCap, Word};

use crate::clock::{self, TimerAction};
use crate::error::{SosError, SosResult};
use crate::file;
use crate::frame;
use crate::layout::{MAX_PATH_LEN, PROCESS_IPC_BUFFER};
use crate::proc::{self, Pid, ProcState, WaitTarget, MAX_PROCESSES, WAIT_ANY};
use crate::server::Server;
use crate::vfs::{FileStat, Fmode, Uio, UioTarget};
use crate::vm::{self, usercopy};

pub const SOS_WRITE: Word = 0;
pub const SOS_READ: Word = 1;
pub const SOS_OPEN: Word = 2;
pub const SOS_CLOSE: Word = 3;
pub const SOS_BRK: Word = 4;
pub const SOS_USLEEP: Word = 5;
pub const SOS_TIME_STAMP: Word = 6;
pub const SOS_GETDIRENT: Word = 7;
pub const SOS_STAT: Word = 8;
pub const SOS_PROCESS_CREATE: Word = 9;
pub const SOS_PROCESS_DELETE: Word = 10;
pub const SOS_PROCESS_ID: Word = 11;
pub const SOS_PROCESS_WAIT: Word = 12;
pub const SOS_PROCESS_STATUS: Word = 13;

const NEG1: Word = Word::MAX;

/// Record layout of one `process_status` entry.
pub const PROCESS_STATUS_ENTRY: usize = 44;
/// Command-name field width inside a `process_status` entry.
pub const PROCESS_NAME_LEN: usize = 32;

fn syscall_name(number: Word) -> &'static str {
    match number {
        SOS_WRITE => "write",
        SOS_READ => "read",
        SOS_OPEN => "open",
        SOS_CLOSE => "close",
        SOS_BRK => "brk",
        SOS_USLEEP => "usleep",
        SOS_TIME_STAMP => "time_stamp",
        SOS_GETDIRENT => "getdirent",
        SOS_STAT => "stat",
        SOS_PROCESS_CREATE => "process_create",
        SOS_PROCESS_DELETE => "process_delete",
        SOS_PROCESS_ID => "process_id",
        SOS_PROCESS_WAIT => "process_wait",
        SOS_PROCESS_STATUS => "process_status",
        _ => "unknown",
    }
}

/// Dispatch one system call. Runs on a coroutine.
pub fn handle_syscall(server: &Arc<Server>, pid: Pid, reply: ReplyCap, msg: &Message) {
    let number = msg.mr(0);
    log::debug!("[pid {pid}] syscall {}", syscall_name(number));
    match number {
        SOS_WRITE => sys_write(server, pid, reply, msg),
        SOS_READ => sys_read(server, pid, reply, msg),
        SOS_OPEN => sys_open(server, pid, reply, msg),
        SOS_CLOSE => sys_close(server, pid, reply, msg),
        SOS_BRK => sys_brk(server, pid, reply, msg),
        SOS_USLEEP => sys_usleep(server, pid, reply, msg),
        SOS_TIME_STAMP => sys_time_stamp(server, reply),
        SOS_GETDIRENT => sys_getdirent(server, pid, reply, msg),
        SOS_STAT => sys_stat(server, pid, reply, msg),
        SOS_PROCESS_CREATE => sys_process_create(server, pid, reply, msg),
        SOS_PROCESS_DELETE => sys_process_delete(server, pid, reply, msg),
        SOS_PROCESS_ID => sys_process_id(server, pid, reply),
        SOS_PROCESS_WAIT => sys_process_wait(server, pid, reply, msg),
        SOS_PROCESS_STATUS => sys_process_status(server, pid, reply, msg),
        _ => {
            log::warn!("[pid {pid}] unknown syscall {number}");
            server.discard_reply(reply);
        }
    }
    clear_coroutine_binding(server, pid);
}

/// Forget the PCB's suspended-coroutine record if it points at us, so a
/// later destroy cannot cancel a slot this handler no longer occupies.
pub fn clear_coroutine_binding(server: &Arc<Server>, pid: Pid) {
    let current = crate::coroutine::CoroutinePool::current();
    if current.is_none() {
        return;
    }
    if let Some(pcb) = server.procs.lock().get_mut(pid) {
        if pcb.coroutine_id == current {
            pcb.coroutine_id = None;
        }
    }
}

/// Answer with the handler's result: the value on success, `-1` on any
/// error, nothing (the capability is freed) when the process is gone.
fn finish(server: &Arc<Server>, reply: ReplyCap, result: SosResult<Word>) {
    match result {
        Ok(value) => server.reply(reply, &[value]),
        Err(SosError::Cancelled) => server.discard_reply(reply),
        Err(_) => server.reply(reply, &[NEG1]),
    }
}

/// A user range is legal when it sits inside one region and wholly below
/// the IPC buffer.
fn check_uaddr(server: &Server, pid: Pid, uaddr: Word, size: usize) -> SosResult<()> {
    let end = u64::from(uaddr) + size as u64;
    let procs = server.procs.lock();
    let pcb = procs.get(pid).ok_or(SosError::Cancelled)?;
    let region = pcb
        .addrspace
        .find_region(uaddr)
        .ok_or(SosError::InvalidAddr)?;
    if end > u64::from(region.base) + u64::from(region.size) {
        return Err(SosError::InvalidAddr);
    }
    if end >= u64::from(PROCESS_IPC_BUFFER) {
        return Err(SosError::InvalidAddr);
    }
    Ok(())
}

fn lookup_ofd(server: &Server, pid: Pid, fd: Word) -> SosResult<usize> {
    let fd = fd as usize;
    if fd >= file::PROCESS_MAX_FILES {
        return Err(SosError::BadArgument);
    }
    let procs = server.procs.lock();
    let pcb = procs.get(pid).ok_or(SosError::Cancelled)?;
    let ofd = pcb.addrspace.fd_table[fd];
    if ofd < 0 {
        return Err(SosError::BadArgument);
    }
    Ok(ofd as usize)
}

fn copy_path(server: &Arc<Server>, pid: Pid, uaddr: Word) -> SosResult<String> {
    check_uaddr(server, pid, uaddr, 0)?;
    frame::pin_frames(server, pid, uaddr, MAX_PATH_LEN);
    let path = usercopy::copy_in_string(server, pid, uaddr, MAX_PATH_LEN);
    frame::unpin_frames(server, pid, uaddr, MAX_PATH_LEN);
    path
}

fn sys_write(server: &Arc<Server>, pid: Pid, reply: ReplyCap, msg: &Message) {
    let (fd, uaddr, len) = (msg.mr(1), msg.mr(2), msg.mr(3) as usize);
    if len == 0 {
        return finish(server, reply, Ok(0));
    }
    let result = (|| {
        check_uaddr(server, pid, uaddr, len)?;
        let ofd = lookup_ofd(server, pid, fd)?;
        let (vnode, offset) = {
            let oft = server.oft.lock();
            let entry = oft.entry(ofd).ok_or(SosError::BadArgument)?;
            if !entry.mode.contains(Fmode::WRITE) {
                return Err(SosError::BadArgument);
            }
            let vnode = entry.vnode.clone().ok_or(SosError::BadArgument)?;
            (vnode, entry.offset)
        };
        let mut uio = Uio::new(UioTarget::Client { pid, uaddr }, len, offset);
        frame::pin_frames(server, pid, uaddr, len);
        let io = vnode.write(server, &mut uio);
        frame::unpin_frames(server, pid, uaddr, len);
        if let Some(entry) = server.oft.lock().entry_mut(ofd) {
            entry.offset = uio.offset;
        }
        io?;
        Ok(uio.transferred() as Word)
    })();
    finish(server, reply, result);
}

fn sys_read(server: &Arc<Server>, pid: Pid, reply: ReplyCap, msg: &Message) {
    let (fd, uaddr, len) = (msg.mr(1), msg.mr(2), msg.mr(3) as usize);
    if len == 0 {
        return finish(server, reply, Ok(0));
    }
    let result = (|| {
        check_uaddr(server, pid, uaddr, len)?;
        let ofd = lookup_ofd(server, pid, fd)?;
        let (vnode, offset) = {
            let oft = server.oft.lock();
            let entry = oft.entry(ofd).ok_or(SosError::BadArgument)?;
            if !entry.mode.contains(Fmode::READ) {
                return Err(SosError::BadArgument);
            }
            let vnode = entry.vnode.clone().ok_or(SosError::BadArgument)?;
            (vnode, entry.offset)
        };
        let mut uio = Uio::new(UioTarget::Client { pid, uaddr }, len, offset);
        frame::pin_frames(server, pid, uaddr, len);
        let io = vnode.read(server, &mut uio);
        frame::unpin_frames(server, pid, uaddr, len);
        if let Some(entry) = server.oft.lock().entry_mut(ofd) {
            entry.offset = uio.offset;
        }
        io?;
        Ok(uio.transferred() as Word)
    })();
    finish(server, reply, result);
}

fn sys_open(server: &Arc<Server>, pid: Pid, reply: ReplyCap, msg: &Message) {
    let (path_uaddr, mode_bits) = (msg.mr(1), msg.mr(2));
    let result = (|| {
        let mode = Fmode::from_bits(mode_bits).ok_or(SosError::BadArgument)?;
        if !mode.intersects(Fmode::READ | Fmode::WRITE) {
            return Err(SosError::BadArgument);
        }
        {
            let procs = server.procs.lock();
            let pcb = procs.get(pid).ok_or(SosError::Cancelled)?;
            if pcb.addrspace.fd_count == file::PROCESS_MAX_FILES {
                return Err(SosError::BadArgument);
            }
        }
        if server.oft.lock().is_full() {
            return Err(SosError::BadArgument);
        }

        let path = copy_path(server, pid, path_uaddr)?;
        let vnode = server.vfs.open(server, &path, mode)?;

        let ofd = server
            .oft
            .lock()
            .alloc(vnode, mode)
            .ok_or(SosError::BadArgument)?;
        let fd = {
            let mut procs = server.procs.lock();
            let free_fd = procs.get_mut(pid).and_then(|pcb| {
                let fd = pcb.addrspace.fd_table.iter().position(|&o| o < 0)?;
                pcb.addrspace.fd_table[fd] = ofd as i32;
                pcb.addrspace.fd_count += 1;
                Some(fd)
            });
            free_fd
        };
        match fd {
            Some(fd) => Ok(fd as Word),
            None => {
                // No descriptor after all: give the entry back.
                file::release(server, ofd);
                Err(SosError::BadArgument)
            }
        }
    })();
    finish(server, reply, result);
}

fn sys_close(server: &Arc<Server>, pid: Pid, reply: ReplyCap, msg: &Message) {
    let fd = msg.mr(1);
    let result = (|| {
        let ofd = lookup_ofd(server, pid, fd)?;
        {
            let mut procs = server.procs.lock();
            let pcb = procs.get_mut(pid).ok_or(SosError::Cancelled)?;
            pcb.addrspace.fd_table[fd as usize] = -1;
            pcb.addrspace.fd_count -= 1;
        }
        file::release(server, ofd);
        Ok(0)
    })();
    finish(server, reply, result);
}

fn sys_brk(server: &Arc<Server>, pid: Pid, reply: ReplyCap, msg: &Message) {
    // brk answers 0 on success and 1 on failure, not -1.
    match vm::brk(server, pid, msg.mr(1)) {
        Ok(()) => server.reply(reply, &[0]),
        Err(SosError::Cancelled) => server.discard_reply(reply),
        Err(_) => server.reply(reply, &[1]),
    }
}

fn sys_usleep(server: &Arc<Server>, pid: Pid, reply: ReplyCap, msg: &Message) {
    let micros = msg.mr(1);
    if (micros as i32) < 0 {
        return finish(server, reply, Err(SosError::BadArgument));
    }
    log::trace!("[pid {pid}] sleeping {micros}us");
    // The reply is sent by the timer callback when it fires.
    clock::register_timer(server, u64::from(micros), TimerAction::WakeClient(reply));
}

fn sys_time_stamp(server: &Arc<Server>, reply: ReplyCap) {
    let now = clock::time_stamp(server);
    server.reply(reply, &[now as Word, (now >> 32) as Word]);
}

fn sys_getdirent(server: &Arc<Server>, pid: Pid, reply: ReplyCap, msg: &Message) {
    let (pos, uaddr, len) = (msg.mr(1), msg.mr(2), msg.mr(3) as usize);
    let result = (|| {
        check_uaddr(server, pid, uaddr, 0)?;
        if (pos as i32) < 0 {
            return Err(SosError::BadArgument);
        }
        let root = server.vfs.open(server, "", Fmode::READ)?;
        let mut uio = Uio::new(UioTarget::Client { pid, uaddr }, len, u64::from(pos));
        frame::pin_frames(server, pid, uaddr, len);
        let io = root.getdirent(server, &mut uio);
        frame::unpin_frames(server, pid, uaddr, len);
        io?;
        Ok(uio.transferred() as Word)
    })();
    finish(server, reply, result);
}

fn sys_stat(server: &Arc<Server>, pid: Pid, reply: ReplyCap, msg: &Message) {
    let (path_uaddr, buf_uaddr) = (msg.mr(1), msg.mr(2));
    let result = (|| {
        check_uaddr(server, pid, buf_uaddr, FileStat::SIZE)?;
        let path = copy_path(server, pid, path_uaddr)?;
        let vnode = server.vfs.open(server, &path, Fmode::empty())?;
        let stat = vnode.stat(server)?;
        frame::pin_frames(server, pid, buf_uaddr, FileStat::SIZE);
        let copy = usercopy::copy_out(server, pid, buf_uaddr, &stat.to_bytes());
        frame::unpin_frames(server, pid, buf_uaddr, FileStat::SIZE);
        vnode.close(server, Fmode::empty())?;
        copy?;
        Ok(0)
    })();
    finish(server, reply, result);
}

fn sys_process_create(server: &Arc<Server>, pid: Pid, reply: ReplyCap, msg: &Message) {
    let result = (|| {
        let path = copy_path(server, pid, msg.mr(1))?;
        proc::process_new(server, &path, pid as i32).map(|new_pid| new_pid as Word)
    })();
    finish(server, reply, result);
}

fn sys_process_delete(server: &Arc<Server>, pid: Pid, reply: ReplyCap, msg: &Message) {
    let target = msg.mr(1);
    if target as usize >= MAX_PROCESSES || server.procs.lock().get(target).is_none() {
        return finish(server, reply, Err(SosError::BadArgument));
    }
    if target == pid {
        // Deleting yourself: the dispatcher destroys the process after
        // this handler returns; the caller never sees a reply.
        if let Some(pcb) = server.procs.lock().get_mut(pid) {
            pcb.state = ProcState::SelfDestruct;
        }
        server.discard_reply(reply);
        return;
    }
    let result = proc::process_destroy(server, target).map(|_| 0);
    finish(server, reply, result);
}

fn sys_process_id(server: &Arc<Server>, pid: Pid, reply: ReplyCap) {
    server.reply(reply, &[pid]);
}

fn sys_process_wait(server: &Arc<Server>, pid: Pid, reply: ReplyCap, msg: &Message) {
    let target = msg.mr(1);
    let result = (|| {
        {
            let mut procs = server.procs.lock();
            let has_children = procs
                .live_pids()
                .iter()
                .any(|&p| procs.get(p).map(|c| c.parent) == Some(pid as i32));
            let pcb = procs.get_mut(pid).ok_or(SosError::Cancelled)?;
            if target == WAIT_ANY {
                if !has_children {
                    return Err(SosError::NotFound);
                }
                pcb.wait = WaitTarget::Any;
            } else {
                if target as usize >= MAX_PROCESSES {
                    return Err(SosError::BadArgument);
                }
                pcb.wait = WaitTarget::Pid(target);
            }
            pcb.coroutine_id = crate::coroutine::CoroutinePool::current();
        }
        if target != WAIT_ANY && server.procs.lock().get(target).is_none() {
            // Waiting on a pid that is already gone.
            if let Some(pcb) = server.procs.lock().get_mut(pid) {
                pcb.wait = WaitTarget::None;
            }
            return Err(SosError::NotFound);
        }
        crate::coroutine::CoroutinePool::yield_now().map_err(SosError::from)?;
        let mut procs = server.procs.lock();
        let pcb = procs.get_mut(pid).ok_or(SosError::Cancelled)?;
        let exited = pcb.wait_result.take().ok_or(SosError::NotFound)?;
        Ok(exited)
    })();
    finish(server, reply, result);
}

fn sys_process_status(server: &Arc<Server>, pid: Pid, reply: ReplyCap, msg: &Message) {
    let (uaddr, max) = (msg.mr(1), msg.mr(2) as usize);
    let result = (|| {
        let span = max * PROCESS_STATUS_ENTRY;
        check_uaddr(server, pid, uaddr, span)?;
        let records: Vec<[u8; PROCESS_STATUS_ENTRY]> = {
            let procs = server.procs.lock();
            procs
                .live_pids()
                .into_iter()
                .take(max)
                .filter_map(|p| procs.get(p).map(|pcb| (p, pcb)))
                .map(|(p, pcb)| {
                    let mut rec = [0u8; PROCESS_STATUS_ENTRY];
                    rec[0..4].copy_from_slice(&p.to_le_bytes());
                    rec[4..8].copy_from_slice(&pcb.addrspace.page_count.to_le_bytes());
                    rec[8..12].copy_from_slice(&(pcb.stime_ms as u32).to_le_bytes());
                    let name = pcb.name.as_bytes();
                    let n = name.len().min(PROCESS_NAME_LEN - 1);
                    rec[12..12 + n].copy_from_slice(&name[..n]);
                    rec
                })
                .collect()
        };
        frame::pin_frames(server, pid, uaddr, span);
        let mut copy = Ok(());
        for (i, rec) in records.iter().enumerate() {
            copy = usercopy::copy_out(
                server,
                pid,
                uaddr + (i * PROCESS_STATUS_ENTRY) as Word,
                rec,
            );
            if copy.is_err() {
                break;
            }
        }
        frame::unpin_frames(server, pid, uaddr, span);
        copy?;
        Ok(records.len() as Word)
    })();
    finish(server, reply, result);
}
