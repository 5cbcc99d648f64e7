//! The file, console, timer and memory system calls.

mod common;

use common::{Rig, NEG1};
use sos_kernel_model::Word;
use sos_server::layout::{
    PROCESS_HEAP_END, PROCESS_HEAP_START, PROCESS_STACK_BOT,
};
use sos_server::server::BootConfig;
use sos_server::syscall::{
    SOS_BRK, SOS_CLOSE, SOS_GETDIRENT, SOS_OPEN, SOS_READ, SOS_STAT, SOS_TIME_STAMP, SOS_USLEEP,
    SOS_WRITE,
};
use sos_server::vfs::{FileStat, Fmode};

const ARG_PAGE: Word = PROCESS_STACK_BOT;
const BUF_PAGE: Word = PROCESS_STACK_BOT + 0x2000;

const FM_READ: Word = 1;
const FM_WRITE: Word = 2;
const FM_RW: Word = 3;

#[test]
fn test_open_write_read_file() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());

    // Descriptors 1 and 2 are wired to the console; 0 (stdin) is free
    // until a client opens it explicitly, so the first open lands there.
    let fd = rig.open(pid, ARG_PAGE, "scratch", FM_RW);
    assert_eq!(fd, 0);

    rig.place_bytes(pid, BUF_PAGE, b"persisted");
    let reply = rig
        .syscall(pid, &[SOS_WRITE, fd as Word, BUF_PAGE, 9])
        .unwrap();
    assert_eq!(reply[0], 9);

    // The shared offset advanced; reading continues past what we wrote,
    // so reopen to read from the start.
    let fd2 = rig.open(pid, ARG_PAGE, "scratch", FM_READ);
    let reply = rig
        .syscall(pid, &[SOS_READ, fd2 as Word, BUF_PAGE + 0x100, 9])
        .unwrap();
    assert_eq!(reply[0], 9);
    assert_eq!(rig.touch_read(pid, BUF_PAGE + 0x100, 9), b"persisted");
}

#[test]
fn test_close_twice_fails() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());
    let fd = rig.open(pid, ARG_PAGE, "f", FM_WRITE);
    assert!(fd >= 0);
    let reply = rig.syscall(pid, &[SOS_CLOSE, fd as Word]).unwrap();
    assert_eq!(reply[0], 0);
    let reply = rig.syscall(pid, &[SOS_CLOSE, fd as Word]).unwrap();
    assert_eq!(reply[0], NEG1);
}

#[test]
fn test_bad_fd_and_mode_rejected() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());

    // Unknown fd.
    let reply = rig.syscall(pid, &[SOS_WRITE, 9, ARG_PAGE, 1]).unwrap();
    assert_eq!(reply[0], NEG1);

    // Reading a write-only descriptor (stdout).
    rig.place_bytes(pid, ARG_PAGE, &[0]);
    let reply = rig.syscall(pid, &[SOS_READ, 1, ARG_PAGE, 1]).unwrap();
    assert_eq!(reply[0], NEG1);

    // Writing a read-only descriptor.
    let fd = rig.open(pid, ARG_PAGE, "ro", FM_WRITE);
    rig.syscall(pid, &[SOS_CLOSE, fd as Word]).unwrap();
    let fd = rig.open(pid, ARG_PAGE, "ro", FM_READ);
    let reply = rig.syscall(pid, &[SOS_WRITE, fd as Word, ARG_PAGE, 1]).unwrap();
    assert_eq!(reply[0], NEG1);
}

#[test]
fn test_buffer_outside_regions_rejected() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());
    // 0x7000_0000 lies in no region.
    let reply = rig.syscall(pid, &[SOS_WRITE, 1, 0x7000_0000, 4]).unwrap();
    assert_eq!(reply[0], NEG1);
}

#[test]
fn test_oft_sharing_refcounts() {
    // Two processes sharing console opens: the entry's reference count
    // must drop 3 -> 2 -> 1 -> 0 and the slot free only at the end.
    let mut config = BootConfig::default();
    config
        .archive
        .push(("child".to_string(), common::hello_elf()));
    let (rig, a) = Rig::boot_with_process(config);
    rig.place_str(a, ARG_PAGE, "child");
    let b = rig
        .syscall(a, &[sos_server::syscall::SOS_PROCESS_CREATE, ARG_PAGE])
        .unwrap()[0];

    let fd_a1 = rig.open(a, ARG_PAGE, "console", FM_WRITE);
    let ofd = {
        let procs = rig.server.procs.lock();
        procs.get(a).unwrap().addrspace.fd_table[fd_a1 as usize]
    } as usize;

    // Every open creates its own entry; entries are shared by descriptor
    // inheritance, so build the 3-reference scenario directly.
    rig.server.oft.lock().add_ref(ofd, 2);
    assert_eq!(rig.server.oft.lock().ref_count(ofd), 3);

    sos_server::file::release(&rig.server, ofd);
    assert_eq!(rig.server.oft.lock().ref_count(ofd), 2);
    sos_server::file::release(&rig.server, ofd);
    assert_eq!(rig.server.oft.lock().ref_count(ofd), 1);

    // The last reference goes away through the owner's close syscall.
    let reply = rig.syscall(a, &[SOS_CLOSE, fd_a1 as Word]).unwrap();
    assert_eq!(reply[0], 0);
    assert_eq!(rig.server.oft.lock().ref_count(ofd), 0);
    assert!(rig.server.oft.lock().entry(ofd).is_none());
    let _ = b;
}

#[test]
fn test_console_read_completes_on_newline() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());
    let fd = rig.open(pid, ARG_PAGE, "console", FM_READ);

    // The read blocks until a line arrives.
    rig.place_bytes(pid, BUF_PAGE, &[0; 16]);
    assert!(rig
        .syscall(pid, &[SOS_READ, fd as Word, BUF_PAGE, 16])
        .is_none());

    rig.server.kernel.lock().inject_serial_input(b"ok\n");
    sos_server::dispatcher::run_pending(&rig.server);

    let reply = rig.take_reply(pid).expect("read completed");
    assert_eq!(reply[0], 3);
    assert_eq!(rig.touch_read(pid, BUF_PAGE, 3), b"ok\n");
}

#[test]
fn test_console_write_reaches_serial() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());
    rig.place_bytes(pid, BUF_PAGE, b"console says");
    let reply = rig.syscall(pid, &[SOS_WRITE, 1, BUF_PAGE, 12]).unwrap();
    assert_eq!(reply[0], 12);
    assert_eq!(rig.server.kernel.lock().take_serial_output(), b"console says");
}

#[test]
fn test_brk_moves_heap_within_window() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());

    let reply = rig
        .syscall(pid, &[SOS_BRK, PROCESS_HEAP_START + 0x4000])
        .unwrap();
    assert_eq!(reply[0], 0);
    // The grown heap is now usable.
    rig.touch_write(pid, PROCESS_HEAP_START + 0x1000, b"heap");
    assert_eq!(rig.touch_read(pid, PROCESS_HEAP_START + 0x1000, 4), b"heap");

    // Outside the window: failure is 1 for brk.
    let reply = rig.syscall(pid, &[SOS_BRK, PROCESS_HEAP_END]).unwrap();
    assert_eq!(reply[0], 1);
    let reply = rig
        .syscall(pid, &[SOS_BRK, PROCESS_HEAP_START - 0x1000])
        .unwrap();
    assert_eq!(reply[0], 1);
}

#[test]
fn test_usleep_replies_after_time_passes() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());

    assert!(rig.syscall(pid, &[SOS_USLEEP, 5_000]).is_none());
    rig.server.kernel.lock().advance_time(6_000);
    sos_server::dispatcher::run_pending(&rig.server);
    let reply = rig.take_reply(pid).expect("sleep finished");
    assert_eq!(reply[0], 0);
}

#[test]
fn test_time_stamp_is_monotonic() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());
    let t1 = rig.syscall(pid, &[SOS_TIME_STAMP]).unwrap();
    rig.server.kernel.lock().advance_time(123);
    let t2 = rig.syscall(pid, &[SOS_TIME_STAMP]).unwrap();
    let v1 = u64::from(t1[0]) | (u64::from(t1[1]) << 32);
    let v2 = u64::from(t2[0]) | (u64::from(t2[1]) << 32);
    assert!(v2 >= v1 + 123);
}

#[test]
fn test_stat_reports_size_and_mode() {
    let mut config = BootConfig::default();
    config
        .store_files
        .push(("report".to_string(), vec![7; 123], Fmode::READ));
    let (rig, pid) = Rig::boot_with_process(config);

    rig.place_str(pid, ARG_PAGE, "report");
    let reply = rig
        .syscall(pid, &[SOS_STAT, ARG_PAGE, BUF_PAGE])
        .expect("stat replies");
    assert_eq!(reply[0], 0);

    let bytes = rig.touch_read(pid, BUF_PAGE, FileStat::SIZE);
    let size = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let fmode = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    assert_eq!(size, 123);
    assert_eq!(fmode, Fmode::READ.bits());
}

#[test]
fn test_stat_missing_file() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());
    rig.place_str(pid, ARG_PAGE, "nope");
    let reply = rig.syscall(pid, &[SOS_STAT, ARG_PAGE, BUF_PAGE]).unwrap();
    assert_eq!(reply[0], NEG1);
}

#[test]
fn test_getdirent_walks_the_store() {
    let mut config = BootConfig::default();
    config
        .store_files
        .push(("alpha".to_string(), vec![], Fmode::READ));
    let (rig, pid) = Rig::boot_with_process(config);

    rig.place_bytes(pid, BUF_PAGE, &[0; 32]);
    let reply = rig
        .syscall(pid, &[SOS_GETDIRENT, 0, BUF_PAGE, 32])
        .expect("getdirent replies");
    let n = reply[0];
    assert!(n > 0 && n != NEG1);
    let name = rig.touch_read(pid, BUF_PAGE, n as usize);
    assert_eq!(&name, b"alpha\0");

    // One past the end: zero. Beyond: -1.
    let count = 2; // "alpha" and the pagefile
    let reply = rig
        .syscall(pid, &[SOS_GETDIRENT, count, BUF_PAGE, 32])
        .unwrap();
    assert_eq!(reply[0], 0);
    let reply = rig
        .syscall(pid, &[SOS_GETDIRENT, count + 1, BUF_PAGE, 32])
        .unwrap();
    assert_eq!(reply[0], NEG1);
}

#[test]
fn test_path_without_terminator_rejected() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());
    // A full MAX_PATH_LEN of non-NUL bytes.
    let junk = vec![b'x'; sos_server::layout::MAX_PATH_LEN];
    rig.place_bytes(pid, ARG_PAGE, &junk);
    let reply = rig.syscall(pid, &[SOS_OPEN, ARG_PAGE, FM_READ]).unwrap();
    assert_eq!(reply[0], NEG1);
}

#[test]
fn test_zero_length_transfer_is_trivial() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());
    let reply = rig.syscall(pid, &[SOS_WRITE, 1, ARG_PAGE, 0]).unwrap();
    assert_eq!(reply[0], 0);
}
