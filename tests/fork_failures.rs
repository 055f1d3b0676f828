//! Resource exhaustion during fork comes back as an error, never a crash.

mod shared_exo;

use exokern::KernelConfig;
use libexo::{EnvStatus, Errno, Error};
use shared_exo::*;

#[test]
fn no_free_process_slot() {
    let mut w = World::boot_with(KernelConfig::default().max_envs(1));
    map_rw(w.root(), DATA, &[1]);

    assert_eq!(w.parent.fork(), Err(Error::Os(Errno::ENOFREEENV)));
    assert_eq!(w.parent.fork_raw(), Errno::ENOFREEENV.code());
    assert_eq!(w.kernel.envs().len(), 1);
    assert!(!w.parent.cow_handler_installed());
}

#[test]
fn no_memory_for_the_child_page_directory() {
    let mut w = World::boot();
    map_rw(w.root(), DATA, &[1]);
    w.kernel.limit_frames(w.kernel.frames_in_use());

    assert_eq!(w.parent.fork(), Err(Error::Os(Errno::ENOMEM)));
    assert_eq!(w.kernel.envs().len(), 1);
}

#[test]
fn no_memory_while_copying_leaves_the_child_not_runnable() {
    let mut w = World::boot();
    map_rw(w.root(), DATA, &[1]);
    // Room for the child's page directory but not its first page table.
    w.kernel.limit_frames(w.kernel.frames_in_use() + 1);

    assert_eq!(w.parent.fork_raw(), Errno::ENOMEM.code());
    let envs = w.kernel.envs();
    assert_eq!(envs.len(), 2);
    let child = envs.iter().find(|e| e.parent == w.root().id()).unwrap();
    assert_eq!(child.status, EnvStatus::NotRunnable);
    assert!(!child.has_upcall);
    assert!(w.kernel.process(child.id).is_none());
}

#[test]
fn no_memory_for_the_child_exception_stack() {
    let mut w = World::boot();
    map_rw(w.root(), DATA, &[1]);
    // Child directory and page table, then the parent's exception stack and
    // its page table; nothing left for the child's exception stack.
    w.kernel.limit_frames(w.kernel.frames_in_use() + 4);

    assert_eq!(w.parent.fork(), Err(Error::Os(Errno::ENOMEM)));
    assert!(w.parent.cow_handler_installed());
    let child = w
        .kernel
        .envs()
        .into_iter()
        .find(|e| e.parent == w.root().id())
        .unwrap();
    assert_eq!(child.status, EnvStatus::NotRunnable);
    assert!(!child.has_upcall);
}

#[test]
fn fork_succeeds_once_memory_is_available_again() {
    let mut w = World::boot();
    map_rw(w.root(), DATA, &[1]);
    let budget = w.kernel.frames_in_use() + 1;
    w.kernel.limit_frames(budget);
    assert!(w.parent.fork().is_err());

    w.kernel.limit_frames(budget + 16);
    let child = w.fork_child();
    assert_eq!(read(child.sys(), DATA, 1), vec![1]);
}
