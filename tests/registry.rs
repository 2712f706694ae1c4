//! Cross-process session registry scenarios.
//!
//! Second processes are simulated with real child processes (`sleep`) so
//! PID liveness behaves exactly as in production.

use std::process::{Child, Command};

use chorus::SessionStore;

fn store() -> (tempfile::TempDir, SessionStore) {
    let dir = tempfile::tempdir().unwrap();
    let state = SessionStore::new(dir.path().join("sessions.json"));
    (dir, state)
}

fn live_child() -> Child {
    Command::new("sleep").arg("60").spawn().unwrap()
}

fn reap(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn fresh_start_single_session() {
    let (_dir, store) = store();
    let entry = store
        .register("Eric", "am_eric", 7865, std::process::id(), None)
        .unwrap();

    assert_eq!(entry.name, "Eric");
    assert_eq!(entry.voice, "am_eric");
    assert_eq!(entry.port, 7865);
    assert_eq!(entry.session_id, None);
}

#[test]
fn name_collision_assigns_next_identity() {
    let (_dir, store) = store();
    let first = live_child();
    store
        .register("Eric", "am_eric", 7865, first.id(), None)
        .unwrap();

    let entry = store
        .register("Eric", "am_eric", 7865, std::process::id(), None)
        .unwrap();
    reap(first);

    assert_eq!(entry.name, "Adam");
    assert_eq!(entry.voice, "am_adam");
    assert_eq!(entry.port, 7866);
}

#[test]
fn sibling_reconciliation_adopts_identity() {
    let (_dir, store) = store();

    // Process A registers as Eric and receives its session id.
    let process_a = live_child();
    store
        .register("Eric", "am_eric", 7865, process_a.id(), None)
        .unwrap();
    store.attach_session_id(process_a.id(), "S").unwrap().unwrap();

    // Process B starts while A is alive and lands on Adam.
    let ours = std::process::id();
    let before = store.register("Eric", "am_eric", 7865, ours, None).unwrap();
    assert_eq!(before.name, "Adam");
    assert_eq!(before.voice, "am_adam");

    // The editor hands B the same logical session id: B becomes Eric too.
    let after = store.attach_session_id(ours, "S").unwrap().unwrap();
    reap(process_a);

    assert_eq!(after.name, "Eric");
    assert_eq!(after.voice, "am_eric");
    assert_eq!(after.session_id.as_deref(), Some("S"));
}

#[test]
fn attach_is_idempotent_with_sibling() {
    let (_dir, store) = store();
    let process_a = live_child();
    store
        .register("Eric", "am_eric", 7865, process_a.id(), None)
        .unwrap();
    store.attach_session_id(process_a.id(), "S").unwrap().unwrap();

    let ours = std::process::id();
    store.register("Eric", "am_eric", 7865, ours, None).unwrap();
    let once = store.attach_session_id(ours, "S").unwrap().unwrap();
    let twice = store.attach_session_id(ours, "S").unwrap().unwrap();
    reap(process_a);

    assert_eq!(once, twice);
    assert_eq!(twice.name, "Eric");
}

#[test]
fn crash_cleanup_reclaims_identity_and_port() {
    let (_dir, store) = store();

    // Process A dies without unregistering (SIGKILL leaves its entry).
    let process_a = live_child();
    let pid_a = process_a.id();
    store.register("Eric", "am_eric", 7865, pid_a, None).unwrap();
    reap(process_a);

    // Process B observes the dead PID, removes the entry, and claims both
    // the name and the port.
    let entry = store
        .register("Eric", "am_eric", 7865, std::process::id(), None)
        .unwrap();
    assert_eq!(entry.name, "Eric");
    assert_eq!(entry.port, 7865);

    let live = store.snapshot(std::process::id()).unwrap();
    assert_eq!(live.len(), 1);
    assert!(live.iter().all(|s| s.pid != pid_a));
}

#[test]
fn sweep_removes_flagged_pids() {
    let (_dir, store) = store();
    let ours = std::process::id();
    store.register("Eric", "am_eric", 7865, ours, None).unwrap();

    let other = live_child();
    store
        .register("Adam", "am_adam", 7865, other.id(), None)
        .unwrap();

    // The sweeper decided this sibling's HTTP endpoint has been silent too
    // long.
    let removed = store.sweep(ours, &[other.id()]).unwrap();
    reap(other);

    assert_eq!(removed, 1);
    let live = store.snapshot(ours).unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].name, "Eric");
}

#[test]
fn sweep_never_removes_own_entry() {
    let (_dir, store) = store();
    let ours = std::process::id();
    store.register("Eric", "am_eric", 7865, ours, None).unwrap();

    let removed = store.sweep(ours, &[ours]).unwrap();
    assert_eq!(removed, 0);
    assert_eq!(store.snapshot(ours).unwrap().len(), 1);
}

#[test]
fn snapshot_preserves_entries_across_reads() {
    let (_dir, store) = store();
    let ours = std::process::id();
    store.register("Eric", "am_eric", 7865, ours, None).unwrap();

    let first = store.snapshot(ours).unwrap();
    let second = store.snapshot(ours).unwrap();
    assert_eq!(first, second);
}
