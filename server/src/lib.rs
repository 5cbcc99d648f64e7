//! SOS - a user-level operating-system server for a capability microkernel
//!
//! # Purpose
//! Provides virtual memory, process lifecycle and basic I/O to unprivileged
//! clients that talk to the server over badged IPC endpoints. The core is
//! the frame table with its second-chance swap engine, the per-process
//! two-level software page table, the page-fault handler, a cooperative
//! coroutine scheduler that lets handlers block on disk I/O, and the
//! process table.
//!
//! # Integration Points
//! - Depends on: `sos-kernel-model` (the capability-kernel interface)
//! - Provides to: client processes, over the system-call ABI
//!
//! # Architecture
//! One event-driven dispatcher waits on a single endpoint multiplexing
//! interrupts (badge high bit), VM faults and system calls (badge = pid).
//! Each non-interrupt message runs on a coroutine; handlers that must wait
//! for disk or for a child process yield back to the dispatcher and are
//! resumed when the awaited event arrives.
//!
//! # Testing Strategy
//! - Unit tests: per-module `#[cfg(test)]` coverage
//! - Integration tests: `tests/` drives the server through the kernel
//!   model's client interface (syscalls, faults, swap round-trips)

pub mod clock;
pub mod coroutine;
pub mod dispatcher;
pub mod elf;
pub mod error;
pub mod file;
pub mod frame;
pub mod layout;
pub mod proc;
pub mod server;
pub mod swap;
pub mod syscall;
pub mod vfs;
pub mod vm;

pub use error::{SosError, SosResult};
pub use server::{BootConfig, Server};
