//! Console device over the serial port.
//!
//! Writes go straight to the serial transmitter. Reads register a single
//! pending reader; arriving input is gathered by the serial interrupt
//! handler until a newline or a full buffer, at which point the reader's
//! coroutine is resumed to copy the line out and reply.

use std::sync::Arc;

use sos_kernel_model::Word;

use crate::coroutine::CoroutinePool;
use crate::error::{SosError, SosResult};
use crate::proc::Pid;
use crate::server::Server;
use crate::vfs::{Device, FileStat, Fmode, Uio, UioTarget, Vnode, FTYPE_SPECIAL};
use crate::vm::usercopy;

struct PendingRead {
    pid: Pid,
    uaddr: Word,
    wanted: usize,
    gathered: Vec<u8>,
    coroutine: usize,
    done: bool,
}

pub struct ConsoleDevice {
    pending: spin::Mutex<Option<PendingRead>>,
}

impl ConsoleDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: spin::Mutex::new(None),
        })
    }

    /// Serial interrupt: gather pending input. Bytes arriving with no
    /// reader are dropped, like a terminal with nobody listening.
    pub fn handle_irq(&self, server: &Arc<Server>) {
        let mut finished = None;
        {
            let mut kernel = server.kernel.lock();
            let mut pending = self.pending.lock();
            while let Some(byte) = kernel.serial_recv() {
                let Some(read) = pending.as_mut().filter(|r| !r.done) else {
                    log::trace!("console input with no reader, dropped");
                    continue;
                };
                read.gathered.push(byte);
                if byte == b'\n' || read.gathered.len() == read.wanted {
                    read.done = true;
                    finished = Some(read.coroutine);
                }
            }
        }
        if let Some(id) = finished {
            server.sched.set_resume(id);
        }
    }
}

pub struct ConsoleVnode {
    dev: Arc<ConsoleDevice>,
}

impl Vnode for ConsoleVnode {
    fn write(&self, server: &Arc<Server>, uio: &mut Uio<'_>) -> SosResult<()> {
        let n = uio.remaining;
        let bytes = match &mut uio.target {
            UioTarget::Client { pid, uaddr } => usercopy::copy_in(server, *pid, *uaddr, n)?,
            UioTarget::Buffer(buf) => buf[..n].to_vec(),
            UioTarget::Server { .. } => return Err(SosError::BadArgument),
        };
        let sent = server.kernel.lock().serial_send(&bytes);
        uio.advance(sent);
        Ok(())
    }

    fn read(&self, server: &Arc<Server>, uio: &mut Uio<'_>) -> SosResult<()> {
        let (pid, uaddr) = match &uio.target {
            UioTarget::Client { pid, uaddr } => (*pid, *uaddr),
            _ => return Err(SosError::BadArgument),
        };
        let coroutine = CoroutinePool::current().ok_or(SosError::IoError)?;
        {
            let mut pending = self.dev.pending.lock();
            if pending.is_some() {
                // One reader at a time.
                return Err(SosError::IoError);
            }
            *pending = Some(PendingRead {
                pid,
                uaddr,
                wanted: uio.remaining,
                gathered: Vec::new(),
                coroutine,
                done: false,
            });
        }

        if let Err(cancelled) = CoroutinePool::yield_now() {
            self.dev.pending.lock().take();
            return Err(cancelled.into());
        }

        let read = self
            .dev
            .pending
            .lock()
            .take()
            .ok_or(SosError::IoError)?;
        usercopy::copy_out(server, read.pid, read.uaddr, &read.gathered)?;
        uio.advance(read.gathered.len());
        Ok(())
    }

    fn stat(&self, _server: &Arc<Server>) -> SosResult<FileStat> {
        Ok(FileStat {
            ftype: FTYPE_SPECIAL,
            fmode: Fmode::READ | Fmode::WRITE,
            size: 0,
            ctime_ms: 0,
            atime_ms: 0,
        })
    }
}

/// Device wrapper registering the console under its path name.
pub struct ConsoleEntry(pub Arc<ConsoleDevice>);

impl Device for ConsoleEntry {
    fn open(&self, _server: &Arc<Server>, _path: &str, _mode: Fmode) -> SosResult<Arc<dyn Vnode>> {
        Ok(Arc::new(ConsoleVnode {
            dev: Arc::clone(&self.0),
        }))
    }
}
