//! Copying between client buffers and server memory.
//!
//! Every helper works pagewise: a page that is not resident is faulted in
//! through [`map_page`](crate::vm::map_page) first. Nothing here suspends
//! between translating a page and touching it, so a translation cannot go
//! stale mid-copy.

use std::sync::Arc;

use sos_kernel_model::Word;

use crate::error::{SosError, SosResult};
use crate::layout::{MAX_PATH_LEN, PAGE_MASK, PAGE_SIZE};
use crate::proc::Pid;
use crate::server::Server;
use crate::vm::{self, PteFlags};

/// Translate a client address to its server-window address, if resident.
pub fn translate(server: &Server, pid: Pid, uaddr: Word) -> SosResult<Option<Word>> {
    match vm::pte_read(server, pid, uaddr)? {
        Some(pte)
            if pte.contains_flags(PteFlags::VALID) && !pte.contains_flags(PteFlags::SWAP) =>
        {
            Ok(Some(pte.frame_vaddr() | (uaddr & PAGE_MASK)))
        }
        _ => Ok(None),
    }
}

/// Translate a client address, faulting its page in if necessary.
pub fn ensure_mapped(server: &Arc<Server>, pid: Pid, uaddr: Word) -> SosResult<Word> {
    match vm::map_page(server, pid, uaddr) {
        Ok(frame_vaddr) => Ok(frame_vaddr | (uaddr & PAGE_MASK)),
        Err(SosError::AlreadyMapped) => {
            translate(server, pid, uaddr)?.ok_or(SosError::InternalMapError)
        }
        Err(e) => Err(e),
    }
}

/// Copy bytes into a client buffer, spanning pages as needed.
pub fn copy_out(server: &Arc<Server>, pid: Pid, uaddr: Word, data: &[u8]) -> SosResult<()> {
    let mut cur = uaddr;
    let mut rest = data;
    while !rest.is_empty() {
        let chunk = (PAGE_SIZE - (cur & PAGE_MASK) as usize).min(rest.len());
        let vaddr = ensure_mapped(server, pid, cur)?;
        server
            .kernel
            .lock()
            .server_page_mut(vaddr, chunk)?
            .copy_from_slice(&rest[..chunk]);
        rest = &rest[chunk..];
        cur = cur.wrapping_add(chunk as Word);
    }
    Ok(())
}

/// Copy bytes out of a client buffer, spanning pages as needed.
pub fn copy_in(server: &Arc<Server>, pid: Pid, uaddr: Word, len: usize) -> SosResult<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut cur = uaddr;
    while out.len() < len {
        let chunk = (PAGE_SIZE - (cur & PAGE_MASK) as usize).min(len - out.len());
        let vaddr = ensure_mapped(server, pid, cur)?;
        out.extend_from_slice(server.kernel.lock().server_page(vaddr, chunk)?);
        cur = cur.wrapping_add(chunk as Word);
    }
    Ok(out)
}

/// Copy a NUL-terminated string from the client, mapping at most the two
/// pages a `MAX_PATH_LEN` range can span. Fails when no terminator occurs
/// within the limit.
pub fn copy_in_string(server: &Arc<Server>, pid: Pid, uaddr: Word, max_len: usize) -> SosResult<String> {
    debug_assert!(max_len <= MAX_PATH_LEN);
    let mut bytes = Vec::new();
    let mut cur = uaddr;
    let mut remaining = max_len;
    while remaining > 0 {
        let chunk = (PAGE_SIZE - (cur & PAGE_MASK) as usize).min(remaining);
        let vaddr = ensure_mapped(server, pid, cur)?;
        let kernel = server.kernel.lock();
        let page = kernel.server_page(vaddr, chunk)?;
        if let Some(nul) = page.iter().position(|&b| b == 0) {
            bytes.extend_from_slice(&page[..nul]);
            return String::from_utf8(bytes).map_err(|_| SosError::BadArgument);
        }
        bytes.extend_from_slice(page);
        drop(kernel);
        remaining -= chunk;
        cur = cur.wrapping_add(chunk as Word);
    }
    // No terminator within max_len.
    Err(SosError::BadArgument)
}

/// The page-boundary arithmetic `copy_in_string` relies on.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::page_align;

    #[test]
    fn test_string_spans_at_most_two_pages() {
        let uaddr: Word = 0x0040_0FF0;
        let first = PAGE_SIZE - (uaddr & PAGE_MASK) as usize;
        assert!(first < MAX_PATH_LEN);
        assert!(MAX_PATH_LEN - first <= PAGE_SIZE);
        assert_eq!(page_align(uaddr) + PAGE_SIZE as Word, 0x0040_1000);
    }
}
