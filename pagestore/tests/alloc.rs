mod common;

use common::{opts, reopen_with};
use pagestore::{PageAccess, StoreError, VirtualBlockAddr};
use std::{collections::HashSet, sync::Arc};

#[test]
fn nine_allocations_extend_the_partition() {
    let name = "nine_allocations_extend_the_partition";
    let store = reopen_with(opts(name), true);
    let file_len = || {
        std::fs::metadata(common::test_path(name).join("tablespace.1"))
            .unwrap()
            .len()
    };

    // Partition 1 has no root block, so one batch holds exactly eight free blocks.
    let mut handles: Vec<_> = (0..8)
        .map(|_| store.acquire_new_page(Some(1)).unwrap())
        .collect();
    assert_eq!(file_len(), 8 * 512);

    handles.push(store.acquire_new_page(Some(1)).unwrap());
    assert_eq!(file_len(), 16 * 512);

    let blocks: Vec<u64> = handles.iter().map(|h| h.addr().block()).collect();
    assert_eq!(blocks, (0..9).collect::<Vec<_>>());
    assert!(handles.iter().all(|h| h.pins() == 1 && h.is_dirty()));
}

#[test]
fn root_block_is_never_handed_out() {
    let mut o = opts("root_block_is_never_handed_out");
    o.partitions(1);
    let store = reopen_with(o, true);
    let blocks: HashSet<u64> = (0..9)
        .map(|_| store.acquire_new_page(None).unwrap().addr().block())
        .collect();
    assert_eq!(blocks.len(), 9);
    assert!(!blocks.contains(&0));
}

#[test]
fn allocation_never_hands_out_a_written_block() {
    let store = reopen_with(opts("allocation_never_hands_out_a_written_block"), true);
    let committed = store.acquire_page(VirtualBlockAddr::new(1, 0)).unwrap();
    store.write_at(&committed, 0, b"committed data").unwrap();
    store.release(&committed).unwrap();
    store.commit().unwrap();

    let dirty = store.acquire_page(VirtualBlockAddr::new(1, 1)).unwrap();
    store.write_at(&dirty, 0, b"precious").unwrap();
    store.release(&dirty).unwrap();

    let fresh = store.acquire_new_page(Some(1)).unwrap();
    assert_eq!(fresh.addr(), VirtualBlockAddr::new(1, 2));
    store.release(&fresh).unwrap();
    store.commit().unwrap();

    for (block, data) in [(0, &b"committed data"[..]), (1, &b"precious"[..])] {
        let handle = store.acquire_page(VirtualBlockAddr::new(1, block)).unwrap();
        assert_eq!(handle.header().bytes_used as usize, data.len());
        assert_eq!(store.read_at(&handle, 0, data.len()).unwrap(), data);
        store.release(&handle).unwrap();
    }
}

#[test]
fn concurrent_allocations_never_alias() {
    let store = Arc::new(reopen_with(opts("concurrent_allocations_never_alias"), true));
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            std::thread::spawn(move || {
                (0..50)
                    .map(|_| store.acquire_new_page(None).unwrap().addr())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for thread in threads {
        for addr in thread.join().unwrap() {
            assert!(seen.insert(addr), "{addr} handed out twice");
        }
    }
    assert_eq!(seen.len(), 200);
    assert!(seen.iter().any(|a| a.partition() == 0));
    assert!(seen.iter().any(|a| a.partition() == 1));
}

#[test]
fn unknown_partition_hint_is_rejected() {
    let store = reopen_with(opts("unknown_partition_hint_is_rejected"), true);
    assert!(matches!(
        store.acquire_new_page(Some(2)),
        Err(StoreError::Config(_))
    ));
}

#[test]
fn smallest_first_prefers_the_shorter_partition() {
    let mut o = opts("smallest_first_prefers_the_shorter_partition");
    o.partition_policy(pagestore::PartitionPolicy::SmallestFirst);
    let store = reopen_with(o, true);

    // Grow partition 0 past its first extension.
    for _ in 0..8 {
        store.acquire_new_page(Some(0)).unwrap();
    }
    let handle = store.acquire_new_page(None).unwrap();
    assert_eq!(handle.addr().partition(), 1);
}
