//! Tests for cross-registry locking through a shared sync directory.
//!
//! Each `LockSystem` stands in for a separate process: they share nothing but the
//! directory.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use weft_core::{CoordinationConfig, ThreadContext};
use weft_lock::{LockSet, LockSystem};

fn shared_system(dir: &Path) -> LockSystem {
    let config = CoordinationConfig::default()
        .with_sync_directory(dir)
        .with_wait_poll_interval(Duration::from_millis(5))
        .with_file_poll_interval(Duration::from_millis(2));
    LockSystem::from_config(&config).unwrap()
}

/// Mutex file another process would hold while editing `key`'s state
fn mutex_file(dir: &Path, key: &str) -> PathBuf {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    dir.join("locks").join(format!("{digest}.lock"))
}

fn lock_files(dir: &Path) -> usize {
    std::fs::read_dir(dir.join("locks")).unwrap().count()
}

#[test]
fn test_write_lock_excludes_other_system() {
    let dir = tempfile::tempdir().unwrap();
    let one = shared_system(dir.path());
    let two = shared_system(dir.path());

    let mut a = one.manager(ThreadContext::new("one"));
    let mut b = two.manager(ThreadContext::new("two"));

    a.enter_write_lock("doc:1").unwrap();
    assert!(b.enter_read_lock_no_wait("doc:1").unwrap_err().is_lock_unavailable());
    assert!(b.enter_write_lock_no_wait("doc:1").unwrap_err().is_lock_unavailable());
    assert_eq!(b.held_lock_count(), 0);
    // The refused attempt leaves no local object behind
    assert_eq!(two.lock_registry().live_objects(), 0);

    a.leave_write_lock("doc:1").unwrap();
    b.enter_write_lock_no_wait("doc:1").unwrap();
    b.leave_write_lock("doc:1").unwrap();
    assert_eq!(lock_files(dir.path()), 0);
}

#[test]
fn test_readers_share_across_systems() {
    let dir = tempfile::tempdir().unwrap();
    let one = shared_system(dir.path());
    let two = shared_system(dir.path());

    let mut a = one.manager(ThreadContext::new("one"));
    let mut b = two.manager(ThreadContext::new("two"));
    a.enter_read_lock("doc").unwrap();
    b.enter_read_lock_no_wait("doc").unwrap();
    assert!(b.enter_non_ex_write_lock_no_wait("other").is_ok());

    let mut c = one.manager(ThreadContext::new("one-b"));
    assert!(c.enter_non_ex_write_lock_no_wait("doc").unwrap_err().is_lock_unavailable());
    // Non-exclusive writers share, also across systems
    c.enter_non_ex_write_lock_no_wait("other").unwrap();

    a.clear_locks().unwrap();
    b.clear_locks().unwrap();
    c.clear_locks().unwrap();
    assert_eq!(lock_files(dir.path()), 0);
}

#[test]
fn test_blocking_enter_waits_for_other_system() {
    let dir = tempfile::tempdir().unwrap();
    let one = shared_system(dir.path());
    let two = shared_system(dir.path());

    let mut a = one.manager(ThreadContext::new("one"));
    a.enter_locks(&LockSet::new().write("x").write("y")).unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let waiter = thread::spawn(move || {
        let mut b = two.manager(ThreadContext::new("two"));
        b.enter_write_lock("y").unwrap();
        entered_tx.send(()).unwrap();
        b.leave_write_lock("y").unwrap();
    });

    assert!(entered_rx.recv_timeout(Duration::from_millis(50)).is_err());
    a.leave_locks(&LockSet::new().write("x").write("y")).unwrap();
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    waiter.join().unwrap();
}

#[test]
fn test_interrupted_while_waiting_on_other_system() {
    let dir = tempfile::tempdir().unwrap();
    let one = shared_system(dir.path());
    let two = shared_system(dir.path());

    let mut a = one.manager(ThreadContext::new("one"));
    a.enter_write_lock("k").unwrap();

    let ctx = ThreadContext::new("two");
    let remote = ctx.clone();
    let waiter = thread::spawn(move || {
        let mut b = two.manager(ctx);
        let result = b.enter_write_lock("k");
        (result, two.lock_registry().live_objects())
    });

    thread::sleep(Duration::from_millis(30));
    remote.interrupt();
    let (result, live) = waiter.join().unwrap();
    assert!(result.unwrap_err().is_interrupted());
    assert_eq!(live, 0);

    a.leave_write_lock("k").unwrap();
}

#[test]
fn test_held_mutex_file_fails_no_wait_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let system = shared_system(dir.path());
    let mutex = mutex_file(dir.path(), "doc");
    std::fs::write(&mutex, b"").unwrap();

    let mut m = system.manager(ThreadContext::new("one"));
    let started = Instant::now();
    let err = m.enter_write_lock_no_wait("doc").unwrap_err();
    assert!(err.is_lock_unavailable());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(m.held_lock_count(), 0);
    assert_eq!(system.lock_registry().live_objects(), 0);

    std::fs::remove_file(&mutex).unwrap();
    m.enter_write_lock_no_wait("doc").unwrap();
    m.leave_write_lock("doc").unwrap();
}

#[test]
fn test_held_mutex_file_does_not_block_interrupt() {
    let dir = tempfile::tempdir().unwrap();
    let system = shared_system(dir.path());
    let mutex = mutex_file(dir.path(), "doc");
    std::fs::write(&mutex, b"").unwrap();

    let ctx = ThreadContext::new("one");
    ctx.interrupt();
    let mut m = system.manager(ctx);
    let started = Instant::now();
    let err = m.enter_write_lock("doc").unwrap_err();
    assert!(err.is_interrupted());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(m.held_lock_count(), 0);

    std::fs::remove_file(&mutex).unwrap();
}

#[test]
fn test_blocking_enter_waits_out_held_mutex_file() {
    let dir = tempfile::tempdir().unwrap();
    let system = shared_system(dir.path());
    let mutex = mutex_file(dir.path(), "doc");
    std::fs::write(&mutex, b"").unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let waiter = thread::spawn(move || {
        let mut m = system.manager(ThreadContext::new("one"));
        m.enter_write_lock("doc").unwrap();
        entered_tx.send(()).unwrap();
        m.leave_write_lock("doc").unwrap();
    });

    assert!(entered_rx.recv_timeout(Duration::from_millis(50)).is_err());
    std::fs::remove_file(&mutex).unwrap();
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    waiter.join().unwrap();
}

#[test]
fn test_critical_sections_stay_in_process() {
    let dir = tempfile::tempdir().unwrap();
    let one = shared_system(dir.path());
    let two = shared_system(dir.path());

    let mut a = one.manager(ThreadContext::new("one"));
    let mut b = two.manager(ThreadContext::new("two"));
    a.enter_write_critical_section("s").unwrap();
    // Would block forever if sections were shared
    b.enter_write_critical_section("s").unwrap();

    a.leave_write_critical_section("s").unwrap();
    b.leave_write_critical_section("s").unwrap();
    assert_eq!(lock_files(dir.path()), 0);
}

#[test]
fn test_services_shared_across_systems() {
    let dir = tempfile::tempdir().unwrap();
    let one = shared_system(dir.path());
    let two = shared_system(dir.path());

    let handle = one
        .service_registry()
        .register_service_begin_activity("_POOL_web", None)
        .unwrap();
    assert!(two
        .service_registry()
        .is_service_active("_POOL_web", handle.service_name())
        .unwrap());
    one.service_registry().end_service_activity(&handle).unwrap();
    assert!(two
        .service_registry()
        .active_services("_POOL_web")
        .unwrap()
        .is_empty());
}
