//! ELF image loading.
//!
//! Parsing is delegated to `goblin`; this module only validates that the
//! image is a 32-bit executable, walks its loadable segments, and loads
//! each one into the target address space through the ordinary fault path.
//! Freshly allocated frames are zeroed, so the BSS tail of a segment costs
//! nothing beyond mapping its pages.

use std::sync::Arc;

use goblin::elf::{header, program_header, Elf};
use sos_kernel_model::Word;

use crate::error::{SosError, SosResult};
use crate::proc::Pid;
use crate::server::Server;
use crate::vm::usercopy;
use crate::vm::RegionRights;

/// Segment permissions: execute implies read, there is no execute right on
/// a mapping.
fn rights_from_flags(p_flags: u32) -> RegionRights {
    let mut rights = RegionRights::empty();
    if p_flags & (program_header::PF_R | program_header::PF_X) != 0 {
        rights |= RegionRights::READ;
    }
    if p_flags & program_header::PF_W != 0 {
        rights |= RegionRights::WRITE;
    }
    rights
}

/// Parse and validate a client image: well-formed, 32-bit, executable.
fn parse_image(image: &[u8]) -> SosResult<Elf<'_>> {
    let elf = Elf::parse(image).map_err(|err| {
        log::warn!("rejecting ELF image: {err}");
        SosError::BadArgument
    })?;
    if elf.is_64 || elf.header.e_type != header::ET_EXEC {
        return Err(SosError::BadArgument);
    }
    Ok(elf)
}

/// Load an ELF image into a process's address space: one region per
/// loadable segment, file contents copied in through the fault path.
/// Returns the entry point.
pub fn load(server: &Arc<Server>, pid: Pid, image: &[u8]) -> SosResult<Word> {
    let elf = parse_image(image)?;
    log::debug!(
        "loading image for pid {pid}: entry {:#x}, {} program headers",
        elf.entry,
        elf.program_headers.len()
    );

    for ph in &elf.program_headers {
        if ph.p_type != program_header::PT_LOAD {
            continue;
        }
        if ph.p_filesz > ph.p_memsz {
            return Err(SosError::BadArgument);
        }
        let file_offset = ph.p_offset as usize;
        let file_size = ph.p_filesz as usize;
        let src = image
            .get(file_offset..file_offset + file_size)
            .ok_or(SosError::BadArgument)?;

        log::debug!(
            "  load segment: virt {:#x} + {:#x} (file {:#x}) flags {:#x}",
            ph.p_vaddr,
            ph.p_memsz,
            ph.p_filesz,
            ph.p_flags
        );

        {
            let mut procs = server.procs.lock();
            let pcb = procs.get_mut(pid).ok_or(SosError::NotFound)?;
            pcb.addrspace.define_region(
                ph.p_vaddr as Word,
                ph.p_memsz as Word,
                rights_from_flags(ph.p_flags),
            );
        }
        // Copy the file-backed part; the BSS tail is covered by the frames
        // being zeroed on allocation.
        usercopy::copy_out(server, pid, ph.p_vaddr as Word, src)?;
        // Touch the tail's pages so the whole segment is mapped before the
        // thread starts.
        let mut addr = ph.p_vaddr + ph.p_filesz;
        let seg_end = ph.p_vaddr + ph.p_memsz;
        while addr < seg_end {
            usercopy::ensure_mapped(server, pid, addr as Word)?;
            addr = (addr & !0xFFF) + 0x1000;
        }
    }
    Ok(elf.entry as Word)
}
