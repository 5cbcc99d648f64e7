//! The default file store: the remote file service's stand-in.
//!
//! Files live in server memory; reads and writes behave like remote I/O by
//! posting a disk-completion interrupt and suspending the calling
//! coroutine until the dispatcher routes the completion back. The store
//! also backs the `pagefile`, the sparse byte file the swap engine
//! addresses in page-sized slots.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::coroutine::CoroutinePool;
use crate::error::{SosError, SosResult};
use crate::server::Server;
use crate::vfs::{Device, FileStat, Fmode, Uio, UioTarget, Vnode, FTYPE_FILE};
use crate::vm::usercopy;

struct FileData {
    bytes: Vec<u8>,
    mode: Fmode,
    ctime_ms: u64,
    atime_ms: u64,
}

pub struct FileStore {
    files: spin::Mutex<BTreeMap<String, FileData>>,
}

impl FileStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            files: spin::Mutex::new(BTreeMap::new()),
        })
    }

    /// Install a file with fixed contents and mode (boot images, fixtures).
    pub fn install(&self, name: &str, bytes: Vec<u8>, mode: Fmode) {
        self.files.lock().insert(
            name.to_string(),
            FileData {
                bytes,
                mode,
                ctime_ms: 0,
                atime_ms: 0,
            },
        );
    }

    /// Current length of a file, if it exists.
    pub fn len_of(&self, name: &str) -> Option<usize> {
        self.files.lock().get(name).map(|f| f.bytes.len())
    }
}

/// Complete an I/O the way the remote store would: raise the completion
/// interrupt and suspend until the dispatcher resumes us. Outside a
/// coroutine (unit tests, boot fixtures) the transfer is already complete
/// and the wait is skipped.
fn disk_delay(server: &Arc<Server>) -> SosResult<()> {
    let Some(id) = CoroutinePool::current() else {
        return Ok(());
    };
    server.kernel.lock().post_disk_completion(id as u32);
    CoroutinePool::yield_now()?;
    Ok(())
}

/// Move bytes from a file into a uio target.
fn read_into_target(server: &Arc<Server>, uio: &mut Uio<'_>, src: &[u8]) -> SosResult<usize> {
    let offset = uio.offset.min(src.len() as u64) as usize;
    let n = uio.remaining.min(src.len() - offset);
    let done = uio.transferred();
    let data = &src[offset..offset + n];
    match &mut uio.target {
        UioTarget::Client { pid, uaddr } => {
            let (pid, uaddr) = (*pid, *uaddr);
            usercopy::copy_out(server, pid, uaddr + done as u32, data)?;
        }
        UioTarget::Server { vaddr } => {
            let vaddr = *vaddr + done as u32;
            server
                .kernel
                .lock()
                .server_page_mut(vaddr, n)?
                .copy_from_slice(data);
        }
        UioTarget::Buffer(buf) => {
            buf[done..done + n].copy_from_slice(data);
        }
    }
    uio.advance(n);
    Ok(n)
}

/// Move bytes from a uio target into a file, growing it sparsely.
fn write_from_target(server: &Arc<Server>, uio: &mut Uio<'_>, dst: &mut Vec<u8>) -> SosResult<usize> {
    let n = uio.remaining;
    let done = uio.transferred();
    let data = match &mut uio.target {
        UioTarget::Client { pid, uaddr } => {
            let (pid, uaddr) = (*pid, *uaddr);
            usercopy::copy_in(server, pid, uaddr + done as u32, n)?
        }
        UioTarget::Server { vaddr } => {
            let vaddr = *vaddr + done as u32;
            server.kernel.lock().server_page(vaddr, n)?.to_vec()
        }
        UioTarget::Buffer(buf) => buf[done..done + n].to_vec(),
    };
    let offset = uio.offset as usize;
    if dst.len() < offset + data.len() {
        dst.resize(offset + data.len(), 0);
    }
    dst[offset..offset + data.len()].copy_from_slice(&data);
    uio.advance(n);
    Ok(n)
}

pub struct FileVnode {
    store: Arc<FileStore>,
    name: String,
}

impl Vnode for FileVnode {
    fn read(&self, server: &Arc<Server>, uio: &mut Uio<'_>) -> SosResult<()> {
        // Snapshot, then transfer: the copy may fault client pages in and
        // must not hold the store lock while it does.
        let src = {
            let mut files = self.store.files.lock();
            let file = files.get_mut(&self.name).ok_or(SosError::NotFound)?;
            file.atime_ms = server.kernel.lock().now_us() / 1000;
            file.bytes.clone()
        };
        read_into_target(server, uio, &src)?;
        disk_delay(server)
    }

    fn write(&self, server: &Arc<Server>, uio: &mut Uio<'_>) -> SosResult<()> {
        let mut contents = {
            let files = self.store.files.lock();
            files.get(&self.name).ok_or(SosError::NotFound)?.bytes.clone()
        };
        write_from_target(server, uio, &mut contents)?;
        {
            let mut files = self.store.files.lock();
            let file = files.get_mut(&self.name).ok_or(SosError::NotFound)?;
            file.bytes = contents;
            file.atime_ms = server.kernel.lock().now_us() / 1000;
        }
        disk_delay(server)
    }

    fn stat(&self, _server: &Arc<Server>) -> SosResult<FileStat> {
        let files = self.store.files.lock();
        let file = files.get(&self.name).ok_or(SosError::NotFound)?;
        Ok(FileStat {
            ftype: FTYPE_FILE,
            fmode: file.mode,
            size: file.bytes.len() as u32,
            ctime_ms: file.ctime_ms as u32,
            atime_ms: file.atime_ms as u32,
        })
    }
}

/// The store's root directory: `getdirent` only.
pub struct DirVnode {
    store: Arc<FileStore>,
}

impl Vnode for DirVnode {
    fn getdirent(&self, server: &Arc<Server>, uio: &mut Uio<'_>) -> SosResult<()> {
        let pos = uio.offset as usize;
        let names: Vec<String> = self.store.files.lock().keys().cloned().collect();
        if pos > names.len() {
            return Err(SosError::IoError);
        }
        if pos == names.len() {
            // One past the last entry: zero bytes, success.
            return Ok(());
        }
        let mut bytes = names[pos].as_bytes().to_vec();
        bytes.push(0);
        bytes.truncate(uio.remaining);
        let n = bytes.len();
        match &mut uio.target {
            UioTarget::Client { pid, uaddr } => {
                let (pid, uaddr) = (*pid, *uaddr);
                usercopy::copy_out(server, pid, uaddr, &bytes)?;
            }
            UioTarget::Buffer(buf) => buf[..n].copy_from_slice(&bytes),
            UioTarget::Server { .. } => return Err(SosError::BadArgument),
        }
        uio.remaining -= n;
        Ok(())
    }
}

/// Device wrapper registering the store as the default (empty-prefix)
/// path handler.
pub struct StoreDevice(pub Arc<FileStore>);

impl Device for StoreDevice {
    fn open(&self, _server: &Arc<Server>, path: &str, mode: Fmode) -> SosResult<Arc<dyn Vnode>> {
        if path.is_empty() {
            return Ok(Arc::new(DirVnode {
                store: Arc::clone(&self.0),
            }));
        }
        {
            let mut files = self.0.files.lock();
            match files.get(path) {
                Some(file) => {
                    // Honour per-file access bits, except for mode-less
                    // stat opens.
                    if !mode.is_empty() && !file.mode.contains(mode & (Fmode::READ | Fmode::WRITE)) {
                        return Err(SosError::BadArgument);
                    }
                }
                None => {
                    if !mode.contains(Fmode::WRITE) {
                        return Err(SosError::NotFound);
                    }
                    files.insert(
                        path.to_string(),
                        FileData {
                            bytes: Vec::new(),
                            mode: Fmode::READ | Fmode::WRITE,
                            ctime_ms: 0,
                            atime_ms: 0,
                        },
                    );
                }
            }
        }
        Ok(Arc::new(FileVnode {
            store: Arc::clone(&self.0),
            name: path.to_string(),
        }))
    }
}
