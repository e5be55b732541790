mod common;

use common::{opts, reopen_with};
use pagestore::{BackingMode, Options, PageAccess};

fn mmap_opts(name: &str) -> Options {
    let mut o = opts(name);
    o.backing_mode(BackingMode::MemoryMapped);
    o
}

#[test]
fn memory_mapped_commit_and_rollback() {
    let name = "memory_mapped_commit_and_rollback";
    let store = reopen_with(mmap_opts(name), true);

    let mut handle = store.acquire_new_page(Some(0)).unwrap();
    let committed = handle.addr();
    store.write_bytes(&mut handle, &[4; 1200]).unwrap();
    store.release(&handle).unwrap();
    store.commit().unwrap();

    let handle = store.acquire_new_page(Some(1)).unwrap();
    let rolled_back = handle.addr();
    store.write_at(&handle, 0, &[8; 100]).unwrap();
    store.release(&handle).unwrap();
    store.checkpoint().unwrap();
    store.rollback().unwrap();
    drop(store);

    // Files written through a map read back the same through plain I/O.
    let store = reopen_with(opts(name), false);
    let mut handle = store.acquire_page(committed).unwrap();
    let mut buf = vec![0u8; 1200];
    assert_eq!(store.read_bytes(&mut handle, &mut buf).unwrap(), 1200);
    assert!(buf.iter().all(|b| *b == 4));

    let handle = store.acquire_page(rolled_back).unwrap();
    assert_eq!(handle.header().bytes_in_use, 0);
}

#[test]
fn memory_mapped_files_grow() {
    let mut o = mmap_opts("memory_mapped_files_grow");
    o.partitions(1);
    let store = reopen_with(o, true);
    let handles: Vec<_> = (0..20)
        .map(|_| store.acquire_new_page(None).unwrap())
        .collect();
    for (i, handle) in handles.iter().enumerate() {
        store.write_at(handle, 0, &[i as u8; 4]).unwrap();
        store.release(handle).unwrap();
    }
    store.commit().unwrap();
    store.force_clear().unwrap();
    for (i, handle) in handles.iter().enumerate() {
        let again = store.acquire_page(handle.addr()).unwrap();
        assert_eq!(store.read_at(&again, 0, 4).unwrap(), vec![i as u8; 4]);
    }
}
