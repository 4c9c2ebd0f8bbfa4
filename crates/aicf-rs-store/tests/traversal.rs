//! Path confinement through the writer and reader entry points.

use aicf_rs_store::{Role, StoreError, WriterSettings};
use aicf_rs_test_utils::{TempStore, record};
use pretty_assertions::assert_eq;
use std::fs;

const ESCAPES: &[&str] = &[
    "../outside.aicf",
    "../../etc/passwd",
    "nested/../../outside.aicf",
    "./././../outside.aicf",
    "%2e%2e/outside.aicf",
    "%2E%2E%2Foutside.aicf",
    "nested/%2e%2e/%2e%2e/outside.aicf",
    "%252e%252e%252foutside.aicf",
    "..%252f..%252fetc%252fpasswd",
    "chat\0.aicf",
    "chat%00.aicf",
    "..\\outside.aicf",
    "/etc/passwd",
];

#[test]
fn writer_rejects_every_escape() {
    let store = TempStore::new();
    let writer = store.writer(WriterSettings::default());
    for requested in ESCAPES {
        match writer.handle(requested) {
            Err(StoreError::PathTraversal { .. }) => {}
            other => panic!("expected traversal for {requested:?}, got {other:?}"),
        }
    }
}

#[test]
fn reader_rejects_every_escape_at_open() {
    let store = TempStore::new();
    let reader = store.reader();
    for requested in ESCAPES {
        match reader.open(requested) {
            Err(StoreError::PathTraversal { .. }) => {}
            other => panic!("expected traversal for {requested:?}, got {other:?}"),
        }
    }
}

#[test]
fn paths_inside_root_resolve_canonically() {
    let store = TempStore::new();
    let writer = store.writer(WriterSettings::default());
    let handle = writer
        .handle("sessions/2025/../2025/./chat.aicf")
        .expect("handle");
    assert_eq!(handle.path(), store.path("sessions/2025/chat.aicf"));

    writer
        .append(&handle, record("1", Role::User, "hello"))
        .expect("append");
    assert_eq!(store.lines("sessions/2025/chat.aicf").len(), 1);

    let encoded = writer.handle("sessions%2f2025%2fchat.aicf").expect("handle");
    assert_eq!(encoded.path(), handle.path());
}

#[cfg(unix)]
#[test]
fn symlinked_directories_cannot_leave_root() {
    use std::os::unix::fs::symlink;

    let outside = TempStore::new();
    let store = TempStore::new();
    symlink(outside.root(), store.path("linked")).expect("symlink");
    let writer = store.writer(WriterSettings::default());

    assert!(matches!(
        writer.handle("linked/chat.aicf"),
        Err(StoreError::PathTraversal { .. })
    ));
    outside.write_raw("chat.aicf", "");
    assert!(matches!(
        store.reader().open("linked/chat.aicf"),
        Err(StoreError::PathTraversal { .. })
    ));
    assert_eq!(fs::read_to_string(outside.path("chat.aicf")).expect("read"), "");
}
