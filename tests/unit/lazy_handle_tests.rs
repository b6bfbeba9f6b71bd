//! Unit tests for lazily opened, reference-counted file handles.

use std::sync::Arc;

use datagate::engine::lazy::HandleRegistry;

fn data_file(contents: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("data.bin");
    std::fs::write(&path, contents).expect("write");
    (dir, path)
}

#[tokio::test]
async fn nothing_opens_until_first_use() {
    let (_dir, path) = data_file(b"hello");
    let registry = Arc::new(HandleRegistry::new());

    let handle = registry.acquire(&path);
    assert!(!handle.is_open());
    assert_eq!(registry.stats().opened, 0);

    drop(handle);
    let stats = registry.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.closed, 0);
}

#[tokio::test]
async fn concurrent_holders_share_one_open_file() {
    let (_dir, path) = data_file(b"shared contents");
    let registry = Arc::new(HandleRegistry::new());

    let first = registry.acquire(&path);
    let second = registry.acquire(&path);
    assert_eq!(registry.holders(&path), 2);

    let a = first.file().await.expect("open");
    let b = second.file().await.expect("open");
    assert!(Arc::ptr_eq(&a, &b));
    assert!(second.is_open());
    assert_eq!(registry.stats().opened, 1);

    drop(first);
    assert_eq!(registry.holders(&path), 1);
    assert_eq!(registry.stats().closed, 0);

    drop(second);
    let stats = registry.stats();
    assert_eq!(registry.holders(&path), 0);
    assert_eq!(stats.closed, 1);
    assert_eq!(stats.open, 0);
}

#[tokio::test]
async fn reacquiring_after_close_reopens() {
    let (_dir, path) = data_file(b"x");
    let registry = Arc::new(HandleRegistry::new());

    let handle = registry.acquire(&path);
    handle.file().await.expect("open");
    drop(handle);

    let again = registry.acquire(&path);
    assert!(!again.is_open());
    again.file().await.expect("reopen");
    assert_eq!(registry.stats().opened, 2);
}

#[tokio::test]
async fn positional_reads_do_not_share_a_cursor() {
    let (_dir, path) = data_file(b"0123456789");
    let registry = Arc::new(HandleRegistry::new());
    let handle = registry.acquire(&path);

    assert_eq!(handle.read_at(2, 3).await.expect("read"), b"234");
    assert_eq!(handle.read_at(0, 2).await.expect("read"), b"01");
    assert_eq!(handle.read_at(8, 10).await.expect("short read"), b"89");
    assert!(handle.read_at(20, 4).await.expect("past eof").is_empty());
    assert_eq!(handle.len().await.expect("len"), 10);
}

#[tokio::test]
async fn missing_file_fails_on_first_use() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Arc::new(HandleRegistry::new());
    let handle = registry.acquire(&dir.path().join("absent"));
    assert!(handle.file().await.is_err());
    assert!(!handle.is_open());
}
