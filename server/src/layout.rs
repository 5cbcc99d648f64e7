//! Virtual memory layout, client side and server side.

use sos_kernel_model::Word;

pub use sos_kernel_model::{page_align, PAGE_BITS, PAGE_MASK, PAGE_SIZE};

/// Base of the server window through which every managed frame is mapped.
pub const FRAME_WINDOW_BASE: Word = 0x3000_0000;

/// Client heap: grows up from the base, bounded by the end.
pub const PROCESS_HEAP_START: Word = 0x4000_0000;
pub const PROCESS_HEAP_END: Word = 0x6000_0000;

/// Client stack: a fixed window, growing down from the top.
pub const PROCESS_STACK_BOT: Word = 0x8F00_0000;
pub const PROCESS_STACK_TOP: Word = 0x9000_0000;

/// Client IPC buffer page. Pages mapped at or above this address are
/// allocated unswappable.
pub const PROCESS_IPC_BUFFER: Word = 0xA000_0000;

/// Longest path accepted from a client.
pub const MAX_PATH_LEN: usize = 512;

static_assertions::const_assert!(PROCESS_HEAP_START < PROCESS_HEAP_END);
static_assertions::const_assert!(PROCESS_STACK_BOT < PROCESS_STACK_TOP);
static_assertions::const_assert!(PROCESS_STACK_TOP <= PROCESS_IPC_BUFFER);
// A path fits in two pages, which is what the string copier maps.
static_assertions::const_assert!(MAX_PATH_LEN <= PAGE_SIZE);
