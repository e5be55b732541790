mod common;

use common::{opts, reopen_with, setup};
use pagestore::{Metric, PageAccess, StoreError, META_WRITE};

#[test]
fn committed_page_survives_reopen() {
    let store = setup("committed_page_survives_reopen", true);
    let handle = store.acquire_new_page(Some(0)).unwrap();
    let addr = handle.addr();
    store.write_at(&handle, 0, &[0xAB; 100]).unwrap();
    store.release(&handle).unwrap();
    store.commit().unwrap();
    assert_eq!(store.commit_seqn(), 1);
    assert!(!handle.is_dirty());
    assert_eq!(store.metrics().get(Metric::PagesFlushed), Some(1));
    drop(store);

    let store = reopen_with(opts("committed_page_survives_reopen"), false);
    assert_eq!(store.commit_seqn(), 1);
    let handle = store.acquire_page(addr).unwrap();
    assert_eq!(handle.header().bytes_in_use, 100);
    assert_eq!(handle.header().bytes_used, 100);
    assert!(!handle.is_dirty());
    assert_eq!(store.read_at(&handle, 0, 100).unwrap(), vec![0xAB; 100]);
    store.release(&handle).unwrap();
}

#[test]
fn empty_commit_still_advances() {
    let store = setup("empty_commit_still_advances", true);
    store.commit().unwrap();
    store.commit().unwrap();
    assert_eq!(store.commit_seqn(), 2);
}

#[test]
fn commit_discards_the_logs() {
    let store = setup("commit_discards_the_logs", true);
    let handle = store.acquire_new_page(Some(1)).unwrap();
    store.write_at(&handle, 0, b"x").unwrap();
    store.release(&handle).unwrap();
    assert_eq!(store.log_state(1), Some(pagestore::LogState::Logging));
    store.commit().unwrap();
    assert_eq!(store.log_state(1), Some(pagestore::LogState::Idle));

    // Nothing is left to undo.
    store.rollback().unwrap();
    let handle = store.acquire_page(handle.addr()).unwrap();
    assert_eq!(store.read_at(&handle, 0, 1).unwrap(), b"x");
}

#[test]
fn failed_commit_point_is_rolled_back_on_reopen() {
    let store = setup("failed_commit_point_is_rolled_back_on_reopen", true);
    let handle = store.acquire_new_page(Some(0)).unwrap();
    let addr = handle.addr();
    store.write_at(&handle, 0, &[5; 64]).unwrap();
    store.release(&handle).unwrap();

    store.failpoints().enable(META_WRITE);
    let err = store.commit().unwrap_err();
    assert!(matches!(err, StoreError::Other(_)));
    assert_eq!(store.commit_seqn(), 0);
    drop(store);

    // The page reached the partition file, but the commit point did not.
    let store = reopen_with(opts("failed_commit_point_is_rolled_back_on_reopen"), false);
    assert_eq!(store.commit_seqn(), 0);
    let handle = store.acquire_page(addr).unwrap();
    assert_eq!(handle.header().bytes_in_use, 0);
    assert_eq!(handle.header().bytes_used, 0);
}

#[test]
fn mismatched_options_are_rejected() {
    drop(setup("mismatched_options_are_rejected", true));

    let mut o = opts("mismatched_options_are_rejected");
    o.page_size(1024);
    assert!(matches!(
        pagestore::Pagestore::open(o),
        Err(StoreError::Config(_))
    ));

    let mut o = opts("mismatched_options_are_rejected");
    o.partitions(3);
    assert!(matches!(
        pagestore::Pagestore::open(o),
        Err(StoreError::Config(_))
    ));
}
