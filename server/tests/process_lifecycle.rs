//! Process creation, destruction, waiting, and ELF loading.

mod common;

use common::{build_elf, hello_elf, Rig, NEG1, PF_R, PF_X};
use sos_kernel_model::Word;
use sos_server::layout::{PAGE_SIZE, PROCESS_STACK_BOT, PROCESS_STACK_TOP};
use sos_server::server::BootConfig;
use sos_server::syscall::{
    SOS_PROCESS_CREATE, SOS_PROCESS_DELETE, SOS_PROCESS_ID, SOS_PROCESS_STATUS, SOS_PROCESS_WAIT,
};
use sos_server::vfs::Fmode;

const ARG_PAGE: Word = PROCESS_STACK_BOT;

#[test]
fn test_hello_world_elf_loads_and_starts() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());

    // Segment bytes landed in client memory.
    let code = rig.touch_read(pid, 0x1_0000, 4);
    assert_eq!(code, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    // The zero-filled tail reads back as zeros.
    let tail = rig.touch_read(pid, 0x2_0000 + 0x1000, 16);
    assert!(tail.iter().all(|&b| b == 0));

    // Thread configured at the entry point with the stack pointer at the
    // top of the stack region.
    let (pc, sp) = rig.server.kernel.lock().client_registers(pid).unwrap();
    assert_eq!(pc, 0x1_0000);
    assert_eq!(sp, PROCESS_STACK_TOP);

    // The client writes on its stdout: serial output appears, reply is
    // the byte count.
    rig.place_bytes(pid, ARG_PAGE, b"hi");
    let reply = rig
        .syscall(pid, &[sos_server::syscall::SOS_WRITE, 1, ARG_PAGE, 2])
        .expect("write replies");
    assert_eq!(reply[0], 2);
    assert_eq!(rig.server.kernel.lock().take_serial_output(), b"hi");
}

#[test]
fn test_process_id_reports_badge() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());
    let reply = rig.syscall(pid, &[SOS_PROCESS_ID]).unwrap();
    assert_eq!(reply[0], pid);
}

#[test]
fn test_fork_and_wait() {
    let mut config = BootConfig::default();
    config
        .archive
        .push(("child".to_string(), hello_elf()));
    let (rig, parent) = Rig::boot_with_process(config);

    // Parent creates the child.
    rig.place_str(parent, ARG_PAGE, "child");
    let reply = rig
        .syscall(parent, &[SOS_PROCESS_CREATE, ARG_PAGE])
        .expect("create replies");
    let child = reply[0];
    assert_ne!(child, NEG1);
    assert_eq!(rig.server.procs.lock().count(), 2);

    // Parent waits on the child: no reply yet.
    assert!(rig.syscall(parent, &[SOS_PROCESS_WAIT, child]).is_none());

    // Child deletes itself; the parent's wait completes with the child's
    // pid, and the child's slot is gone.
    assert!(rig.syscall(child, &[SOS_PROCESS_DELETE, child]).is_none());
    let woken = rig.take_reply(parent).expect("wait completed");
    assert_eq!(woken[0], child);
    assert!(rig.server.procs.lock().get(child).is_none());
    assert_eq!(rig.server.procs.lock().count(), 1);
}

#[test]
fn test_wait_any_without_children_fails_fast() {
    let (rig, pid) = Rig::boot_with_process(BootConfig::default());
    let reply = rig
        .syscall(pid, &[SOS_PROCESS_WAIT, NEG1])
        .expect("wait(any) with no children replies immediately");
    assert_eq!(reply[0], NEG1);
}

#[test]
fn test_delete_other_process() {
    let mut config = BootConfig::default();
    config.archive.push(("child".to_string(), hello_elf()));
    let (rig, parent) = Rig::boot_with_process(config);

    rig.place_str(parent, ARG_PAGE, "child");
    let child = rig
        .syscall(parent, &[SOS_PROCESS_CREATE, ARG_PAGE])
        .unwrap()[0];

    let reply = rig
        .syscall(parent, &[SOS_PROCESS_DELETE, child])
        .expect("delete replies");
    assert_eq!(reply[0], 0);
    assert!(rig.server.procs.lock().get(child).is_none());

    // Deleting it again fails.
    let reply = rig.syscall(parent, &[SOS_PROCESS_DELETE, child]).unwrap();
    assert_eq!(reply[0], NEG1);
}

#[test]
fn test_create_from_store_requires_exec_bit() {
    let mut config = BootConfig::default();
    config.store_files.push((
        "tool".to_string(),
        hello_elf(),
        Fmode::READ | Fmode::EXEC,
    ));
    config
        .store_files
        .push(("data".to_string(), hello_elf(), Fmode::READ));
    let (rig, parent) = Rig::boot_with_process(config);

    rig.place_str(parent, ARG_PAGE, "tool");
    let reply = rig.syscall(parent, &[SOS_PROCESS_CREATE, ARG_PAGE]).unwrap();
    assert_ne!(reply[0], NEG1, "executable file must start");

    rig.place_str(parent, ARG_PAGE + 64, "data");
    let reply = rig
        .syscall(parent, &[SOS_PROCESS_CREATE, ARG_PAGE + 64])
        .unwrap();
    assert_eq!(reply[0], NEG1, "non-executable file must be refused");
}

#[test]
fn test_concurrent_first_faults_get_distinct_frames() {
    let mut config = BootConfig::default();
    config.archive.push(("child".to_string(), hello_elf()));
    let (rig, a) = Rig::boot_with_process(config);

    rig.place_str(a, ARG_PAGE, "child");
    let b = rig.syscall(a, &[SOS_PROCESS_CREATE, ARG_PAGE]).unwrap()[0];

    let used_before = rig.server.frames.lock().used_count();

    // Both processes fault their first stack page with both messages
    // queued before the dispatcher runs.
    let fault_a = rig
        .server
        .kernel
        .lock()
        .client_write(a, PROCESS_STACK_BOT + PAGE_SIZE as Word, &[1])
        .unwrap_err();
    let fault_b = rig
        .server
        .kernel
        .lock()
        .client_write(b, PROCESS_STACK_BOT + PAGE_SIZE as Word, &[2])
        .unwrap_err();
    {
        let mut kernel = rig.server.kernel.lock();
        kernel.client_fault(a, fault_a);
        kernel.client_fault(b, fault_b);
    }
    sos_server::dispatcher::run_pending(&rig.server);

    // Each got its own frame backing the same client address.
    let fa = sos_server::vm::usercopy::translate(&rig.server, a, PROCESS_STACK_BOT + PAGE_SIZE as Word)
        .unwrap()
        .expect("mapped for a");
    let fb = sos_server::vm::usercopy::translate(&rig.server, b, PROCESS_STACK_BOT + PAGE_SIZE as Word)
        .unwrap()
        .expect("mapped for b");
    assert_ne!(fa, fb);

    // One stack page each, plus the child's stack page-table pair (the
    // parent's already exists from the argument page).
    let used_after = rig.server.frames.lock().used_count();
    assert_eq!(used_after - used_before, 2 + 2);

    rig.server
        .kernel
        .lock()
        .client_write(a, PROCESS_STACK_BOT + PAGE_SIZE as Word, &[1])
        .expect("now mapped");
}

#[test]
fn test_process_status_lists_live_processes() {
    let mut config = BootConfig::default();
    config.archive.push(("child".to_string(), hello_elf()));
    let (rig, parent) = Rig::boot_with_process(config);
    rig.place_str(parent, ARG_PAGE, "child");
    let child = rig.syscall(parent, &[SOS_PROCESS_CREATE, ARG_PAGE]).unwrap()[0];

    let buf = ARG_PAGE + 0x1000;
    let reply = rig
        .syscall(parent, &[SOS_PROCESS_STATUS, buf, 8])
        .expect("status replies");
    assert_eq!(reply[0], 2);

    let entry = sos_server::syscall::PROCESS_STATUS_ENTRY;
    let bytes = rig.touch_read(parent, buf, 2 * entry);
    let rec_pid = |i: usize| {
        Word::from_le_bytes([
            bytes[i * entry],
            bytes[i * entry + 1],
            bytes[i * entry + 2],
            bytes[i * entry + 3],
        ])
    };
    let mut pids = vec![rec_pid(0), rec_pid(1)];
    pids.sort_unstable();
    let mut expected = vec![parent, child];
    expected.sort_unstable();
    assert_eq!(pids, expected);

    // The command field carries the image name.
    let name_off = entry + 12;
    let name: Vec<u8> = bytes[name_off..name_off + 5].to_vec();
    let candidates: [&[u8]; 2] = [b"hello", b"child"];
    assert!(candidates.contains(&name.as_slice()));
}

#[test]
fn test_destroyed_pid_slot_reused_least_recently() {
    let mut config = BootConfig::default();
    config.archive.push(("child".to_string(), hello_elf()));
    let (rig, parent) = Rig::boot_with_process(config);

    rig.place_str(parent, ARG_PAGE, "child");
    let first = rig.syscall(parent, &[SOS_PROCESS_CREATE, ARG_PAGE]).unwrap()[0];
    rig.syscall(parent, &[SOS_PROCESS_DELETE, first]).unwrap();

    // The freshly freed slot is the most recently freed; never-used slots
    // still win.
    let second = rig.syscall(parent, &[SOS_PROCESS_CREATE, ARG_PAGE]).unwrap()[0];
    assert_ne!(second, first);
}

#[test]
fn test_elf_with_bad_magic_is_refused() {
    let mut config = BootConfig::default();
    let mut broken = build_elf(0x1_0000, &[(0x1_0000, PF_R | PF_X, b"x", 0x1000)]);
    broken[0] = 0;
    config.archive.push(("hello".to_string(), hello_elf()));
    config.archive.push(("broken".to_string(), broken));
    let rig = Rig::boot(config);
    let parent = rig.server.spawn_boot_process("hello").unwrap();

    rig.place_str(parent, ARG_PAGE, "broken");
    let reply = rig.syscall(parent, &[SOS_PROCESS_CREATE, ARG_PAGE]).unwrap();
    assert_eq!(reply[0], NEG1);
    assert_eq!(rig.server.procs.lock().count(), 1);
}
