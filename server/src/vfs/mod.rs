//! Virtual filesystem interface.
//!
//! A vnode is a capability set `{open, close, read, write, stat,
//! getdirent}`, any subset of which may be absent; absent operations keep
//! their default `IoError` implementation. Devices register an operations
//! factory under a path name; paths matching no device fall through to the
//! default file store.

pub mod console;
pub mod filestore;

use std::sync::Arc;

use sos_kernel_model::Word;

use crate::error::{SosError, SosResult};
use crate::proc::Pid;
use crate::server::Server;

bitflags::bitflags! {
    /// File access mode bits, as clients pass them to `open` and as the
    /// store records them per file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Fmode: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

/// File kinds reported by `stat`.
pub const FTYPE_FILE: u32 = 0;
pub const FTYPE_SPECIAL: u32 = 1;

/// Result of a `stat` operation, serialised into the client's buffer by
/// the syscall layer.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub ftype: u32,
    pub fmode: Fmode,
    pub size: u32,
    pub ctime_ms: u32,
    pub atime_ms: u32,
}

impl FileStat {
    pub const SIZE: usize = 20;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.ftype.to_le_bytes());
        out[4..8].copy_from_slice(&self.fmode.bits().to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..16].copy_from_slice(&self.ctime_ms.to_le_bytes());
        out[16..20].copy_from_slice(&self.atime_ms.to_le_bytes());
        out
    }
}

/// Where a transfer's bytes live.
pub enum UioTarget<'a> {
    /// A client buffer, reached through that process's page table.
    Client { pid: Pid, uaddr: Word },
    /// Server-window memory (a frame's contents, for swap I/O).
    Server { vaddr: Word },
    /// A server-heap buffer (swap free-list pages).
    Buffer(&'a mut [u8]),
}

/// Transfer descriptor. Implementations decrement `remaining` by the bytes
/// actually moved and advance `offset` to match.
pub struct Uio<'a> {
    pub target: UioTarget<'a>,
    pub size: usize,
    pub remaining: usize,
    pub offset: u64,
}

impl<'a> Uio<'a> {
    pub fn new(target: UioTarget<'a>, size: usize, offset: u64) -> Self {
        Self {
            target,
            size,
            remaining: size,
            offset,
        }
    }

    pub fn transferred(&self) -> usize {
        self.size - self.remaining
    }

    pub fn advance(&mut self, n: usize) {
        self.remaining -= n;
        self.offset += n as u64;
    }
}

/// The per-file operation set. Every operation defaults to `IoError`,
/// which the syscall layer reports as `-1`.
pub trait Vnode: Send + Sync {
    fn read(&self, _server: &Arc<Server>, _uio: &mut Uio<'_>) -> SosResult<()> {
        Err(SosError::IoError)
    }

    fn write(&self, _server: &Arc<Server>, _uio: &mut Uio<'_>) -> SosResult<()> {
        Err(SosError::IoError)
    }

    fn stat(&self, _server: &Arc<Server>) -> SosResult<FileStat> {
        Err(SosError::IoError)
    }

    fn getdirent(&self, _server: &Arc<Server>, _uio: &mut Uio<'_>) -> SosResult<()> {
        Err(SosError::IoError)
    }

    fn close(&self, _server: &Arc<Server>, _mode: Fmode) -> SosResult<()> {
        Ok(())
    }
}

/// A registered device: turns an open request into a vnode.
pub trait Device: Send + Sync {
    fn open(&self, server: &Arc<Server>, path: &str, mode: Fmode) -> SosResult<Arc<dyn Vnode>>;
}

/// Device registry. Exact names match a device; everything else falls
/// through to the default store registered under the empty prefix.
pub struct Vfs {
    devices: Vec<(String, Arc<dyn Device>)>,
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    pub fn register(&mut self, name: &str, dev: Arc<dyn Device>) {
        self.devices.push((name.to_string(), dev));
    }

    /// Open a path: a device by exact name, or a file in the default
    /// store. The empty path names the store's root directory.
    pub fn open(&self, server: &Arc<Server>, path: &str, mode: Fmode) -> SosResult<Arc<dyn Vnode>> {
        if let Some((_, dev)) = self
            .devices
            .iter()
            .find(|(name, _)| !name.is_empty() && name.as_str() == path)
        {
            return dev.open(server, path, mode);
        }
        let (_, fallback) = self
            .devices
            .iter()
            .find(|(name, _)| name.is_empty())
            .ok_or(SosError::NotFound)?;
        fallback.open(server, path, mode)
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}
