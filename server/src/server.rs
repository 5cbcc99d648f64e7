//! Server construction and boot.
//!
//! The frame table, process table, open-file table and friends are
//! process-wide singletons initialised once at startup and handed to
//! handlers through this struct; the server runs until the machine is
//! reset, so nothing here tears down.

use std::sync::{Arc, Weak};

use sos_kernel_model::{CPtr, KernelModel, ObjectType, ReplyCap, Word};

use crate::clock::Clock;
use crate::coroutine::CoroutinePool;
use crate::dispatcher;
use crate::error::{SosError, SosResult};
use crate::file::{OpenFileTable, CONSOLE_OFD};
use crate::frame::FrameTable;
use crate::proc::{Pid, ProcessTable, MAX_PROCESSES};
use crate::swap::SwapFreeList;
use crate::vfs::console::{ConsoleDevice, ConsoleEntry};
use crate::vfs::filestore::{FileStore, StoreDevice};
use crate::vfs::{Fmode, Vfs, Vnode};

/// Name of the backing swap file.
pub const SWAP_FILE: &str = "pagefile";

/// Boot-time configuration.
pub struct BootConfig {
    /// Physical window handed to the server.
    pub mem_low: Word,
    pub mem_high: Word,
    /// Cap on frames taken from untyped memory; tests use a small value to
    /// force eviction early.
    pub frame_limit: Option<usize>,
    /// Boot archive: name -> executable image.
    pub archive: Vec<(String, Vec<u8>)>,
    /// Files seeded into the store at boot.
    pub store_files: Vec<(String, Vec<u8>, Fmode)>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            mem_low: 0x1000_0000,
            mem_high: 0x1080_0000,
            frame_limit: None,
            archive: Vec::new(),
            store_files: Vec::new(),
        }
    }
}

pub struct Server {
    me: Weak<Server>,

    pub kernel: spin::Mutex<KernelModel>,
    pub frames: spin::Mutex<FrameTable>,
    pub swap: spin::Mutex<SwapFreeList>,
    pub procs: spin::Mutex<ProcessTable>,
    pub oft: spin::Mutex<OpenFileTable>,
    pub clock: spin::Mutex<Clock>,
    pub sched: CoroutinePool,
    pub vfs: Vfs,
    pub console: Arc<ConsoleDevice>,
    pub store: Arc<FileStore>,

    endpoint: CPtr,
    swap_vnode: spin::Once<Arc<dyn Vnode>>,
    archive: Vec<(String, Vec<u8>)>,
}

impl Server {
    /// Bring the server up: kernel objects, frame table, VFS and devices,
    /// open-file table, coroutine pool.
    pub fn boot(config: BootConfig) -> Arc<Server> {
        let mut kernel = KernelModel::new(config.mem_low, config.mem_high);

        // The IPC endpoint comes first; interrupts are routed to it.
        let ep_paddr = kernel
            .ut_alloc(ObjectType::Endpoint.size_bits())
            .expect("untyped for the endpoint");
        let endpoint = kernel
            .untyped_retype(ep_paddr, ObjectType::Endpoint)
            .expect("retyping the endpoint");
        kernel
            .route_interrupts(endpoint)
            .expect("routing interrupts");

        let frames = FrameTable::init(&mut kernel, config.frame_limit);

        let store = FileStore::new();
        for (name, bytes, mode) in config.store_files {
            store.install(&name, bytes, mode);
        }
        let console = ConsoleDevice::new();

        let mut vfs = Vfs::new();
        vfs.register("console", Arc::new(ConsoleEntry(Arc::clone(&console))));
        vfs.register("", Arc::new(StoreDevice(Arc::clone(&store))));

        let server = Arc::new_cyclic(|me| Server {
            me: me.clone(),
            kernel: spin::Mutex::new(kernel),
            frames: spin::Mutex::new(frames),
            swap: spin::Mutex::new(SwapFreeList::new()),
            procs: spin::Mutex::new(ProcessTable::new()),
            oft: spin::Mutex::new(OpenFileTable::new()),
            clock: spin::Mutex::new(Clock::new()),
            sched: CoroutinePool::new(MAX_PROCESSES),
            vfs,
            console,
            store,
            endpoint,
            // Filled right below; opening needs the Arc.
            swap_vnode: spin::Once::new(),
            archive: config.archive,
        });

        // Seed the open-file table with the console on the well-known
        // slot; the server's own reference keeps it from draining.
        let console_vnode = server
            .vfs
            .open(&server, "console", Fmode::WRITE)
            .expect("opening the console");
        server
            .oft
            .lock()
            .seed(CONSOLE_OFD, console_vnode, Fmode::WRITE);

        // Open the swap file. Creation is synchronous at boot (no
        // coroutine is running yet, so the store skips its disk delay).
        let swap_vnode = server
            .vfs
            .open(&server, SWAP_FILE, Fmode::READ | Fmode::WRITE)
            .expect("opening the swap file");
        server.swap_vnode.call_once(|| swap_vnode);

        log::info!("SOS booted");
        server
    }

    pub fn me(&self) -> Arc<Server> {
        self.me.upgrade().expect("server still alive")
    }

    pub fn endpoint(&self) -> CPtr {
        self.endpoint
    }

    pub fn swap_vnode(&self) -> Arc<dyn Vnode> {
        Arc::clone(self.swap_vnode.get().expect("swap file opened at boot"))
    }

    pub fn archive_lookup(&self, name: &str) -> Option<Vec<u8>> {
        self.archive
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, bytes)| bytes.clone())
    }

    /// Send a reply and free its capability.
    pub fn reply(&self, reply: ReplyCap, mrs: &[Word]) {
        if let Err(err) = self.kernel.lock().reply(reply, mrs) {
            log::warn!("reply dropped: {err}");
        }
    }

    /// Free a reply capability without answering.
    pub fn discard_reply(&self, reply: ReplyCap) {
        self.kernel.lock().discard_reply(reply);
    }

    /// Create the first process at boot. Runs the creation on a coroutine
    /// and drives the endpoint until it finishes, so image I/O and
    /// eviction work before the main loop starts.
    pub fn spawn_boot_process(self: &Arc<Self>, name: &str) -> SosResult<Pid> {
        let task_server = self.me();
        let task_name = name.to_string();
        let started = self.sched.start(Box::new(move || {
            match crate::proc::process_new(&task_server, &task_name, -1) {
                Ok(pid) => CoroutinePool::set_own_arg(0, pid + 1),
                Err(err) => {
                    log::warn!("boot process \"{task_name}\": {err}");
                    CoroutinePool::set_own_arg(0, 0);
                }
            }
        }));
        let (id, state) = started.map_err(|_| SosError::NoMemory)?;
        if state == crate::coroutine::RunState::Suspended {
            dispatcher::drive_to_completion(self, id);
        }
        match self.sched.arg(id, 0) {
            0 => Err(SosError::NotFound),
            pid_plus_one => Ok(pid_plus_one - 1),
        }
    }
}
