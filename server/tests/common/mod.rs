//! Shared harness: boots a server and plays the client side of the ABI
//! through the kernel model.
#![allow(dead_code)]

use std::sync::Arc;

use sos_kernel_model::Word;
use sos_server::server::{BootConfig, Server};
use sos_server::{dispatcher, syscall};

pub const PF_X: u32 = 1 << 0;
pub const PF_W: u32 = 1 << 1;
pub const PF_R: u32 = 1 << 2;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const PT_LOAD: u32 = 1;

/// Build a minimal ELF32 executable: little-endian header plus the given
/// `(vaddr, flags, file_bytes, memsz)` segments.
pub fn build_elf(entry: Word, segments: &[(Word, u32, &[u8], u32)]) -> Vec<u8> {
    let phnum = segments.len();
    let phentsize = 32usize;
    let phoff = 52usize;
    let data_start = phoff + phnum * phentsize;

    let mut image = vec![0u8; data_start];
    image[0..4].copy_from_slice(&ELF_MAGIC);
    image[4] = 1; // ELFCLASS32
    image[5] = 1; // ELFDATA2LSB
    image[6] = 1; // EV_CURRENT
    image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image[18..20].copy_from_slice(&40u16.to_le_bytes()); // EM_ARM
    image[24..28].copy_from_slice(&entry.to_le_bytes());
    image[28..32].copy_from_slice(&(phoff as u32).to_le_bytes());
    image[42..44].copy_from_slice(&(phentsize as u16).to_le_bytes());
    image[44..46].copy_from_slice(&(phnum as u16).to_le_bytes());

    let mut offset = data_start as u32;
    for (i, (vaddr, flags, bytes, memsz)) in segments.iter().enumerate() {
        let off = phoff + i * phentsize;
        image[off..off + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[off + 4..off + 8].copy_from_slice(&offset.to_le_bytes());
        image[off + 8..off + 12].copy_from_slice(&vaddr.to_le_bytes());
        image[off + 16..off + 20].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        image[off + 20..off + 24].copy_from_slice(&memsz.to_le_bytes());
        image[off + 24..off + 28].copy_from_slice(&flags.to_le_bytes());
        offset += bytes.len() as u32;
    }
    for (_, _, bytes, _) in segments {
        image.extend_from_slice(bytes);
    }
    image
}

/// An ELF with one 4 KiB RX code segment and one zero-filled RW segment,
/// the smallest interesting client.
pub fn hello_elf() -> Vec<u8> {
    build_elf(
        0x1_0000,
        &[
            (0x1_0000, PF_R | PF_X, &[0xDE, 0xAD, 0xBE, 0xEF], 0x1000),
            (0x2_0000, PF_R | PF_W, &[], 0x2000),
        ],
    )
}

pub struct Rig {
    pub server: Arc<Server>,
}

impl Rig {
    pub fn boot(config: BootConfig) -> Self {
        Self {
            server: Server::boot(config),
        }
    }

    /// Boot with the hello image in the archive and spawn it.
    pub fn boot_with_process(mut config: BootConfig) -> (Self, Word) {
        config.archive.push(("hello".to_string(), hello_elf()));
        let rig = Self::boot(config);
        let pid = rig.server.spawn_boot_process("hello").expect("boot process");
        (rig, pid)
    }

    /// Issue a system call from `pid` and return the reply registers, or
    /// `None` when the call is still blocked (sleeping, waiting).
    pub fn syscall(&self, pid: Word, mrs: &[Word]) -> Option<Vec<Word>> {
        self.server.kernel.lock().client_call(pid, mrs);
        dispatcher::run_pending(&self.server);
        self.server.kernel.lock().take_reply(pid)
    }

    /// Collect a blocked call's reply after later events delivered it.
    pub fn take_reply(&self, pid: Word) -> Option<Vec<Word>> {
        self.server.kernel.lock().take_reply(pid)
    }

    /// Client store, faulting pages in as the MMU would.
    pub fn touch_write(&self, pid: Word, uaddr: Word, data: &[u8]) {
        for _ in 0..16 {
            let fault = {
                let mut kernel = self.server.kernel.lock();
                match kernel.client_write(pid, uaddr, data) {
                    Ok(()) => return,
                    Err(fault) => fault,
                }
            };
            self.server.kernel.lock().client_fault(pid, fault);
            dispatcher::run_pending(&self.server);
        }
        panic!("write to {uaddr:#x} still faulting after 16 rounds");
    }

    /// Client load, faulting pages in as the MMU would.
    pub fn touch_read(&self, pid: Word, uaddr: Word, len: usize) -> Vec<u8> {
        for _ in 0..16 {
            let fault = {
                let kernel = self.server.kernel.lock();
                match kernel.client_read(pid, uaddr, len) {
                    Ok(bytes) => return bytes,
                    Err(fault) => fault,
                }
            };
            self.server.kernel.lock().client_fault(pid, fault);
            dispatcher::run_pending(&self.server);
        }
        panic!("read from {uaddr:#x} still faulting after 16 rounds");
    }

    /// Write a buffer into client memory, then issue a syscall that takes
    /// its address (open, stat, write...).
    pub fn place_bytes(&self, pid: Word, uaddr: Word, bytes: &[u8]) {
        self.touch_write(pid, uaddr, bytes);
    }

    pub fn place_str(&self, pid: Word, uaddr: Word, s: &str) {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.place_bytes(pid, uaddr, &bytes);
    }

    pub fn open(&self, pid: Word, path_uaddr: Word, path: &str, mode: Word) -> i32 {
        self.place_str(pid, path_uaddr, path);
        let reply = self
            .syscall(pid, &[syscall::SOS_OPEN, path_uaddr, mode])
            .expect("open replies");
        reply[0] as i32
    }
}

pub const NEG1: Word = Word::MAX;
