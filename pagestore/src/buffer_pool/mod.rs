//! The page buffer pool of one partition.
//!
//! A concurrent map from virtual block address to [`PageHandle`]. Pages stay cached while pinned
//! or dirty; clean, unpinned pages are removed once they have been idle for longer than the cache
//! TTL, either by the idle sweeper or, when the pool is at its budget, right before a miss is
//! served. This is not an LRU: pins already protect the hot pages.
//!
//! Pins are taken while the map entry is held, so an idle sweep never removes a page that is being
//! acquired.

use dashmap::{mapref::entry::Entry, DashMap};
use pagestore_core::VirtualBlockAddr;
use std::{collections::HashSet, time::Duration};

use crate::{
    error::{Result, StoreError},
    io::PartitionIo,
    metrics::{Metric, Metrics},
};

pub mod handle;

pub use self::handle::{Datablock, PageHandle};

pub struct BufferPool {
    partition: u8,
    page_size: usize,
    /// Soft limit on the number of cached pages.
    budget: usize,
    pages: DashMap<VirtualBlockAddr, PageHandle>,
    metrics: Metrics,
}

impl BufferPool {
    pub fn new(partition: u8, page_size: usize, budget: usize, metrics: Metrics) -> Self {
        Self {
            partition,
            page_size,
            budget,
            pages: DashMap::new(),
            metrics,
        }
    }

    fn check_partition(&self, addr: VirtualBlockAddr) -> Result<()> {
        if addr.partition() != self.partition {
            return Err(StoreError::latch(addr, "address of another partition"));
        }
        Ok(())
    }

    fn pin_cached(&self, addr: VirtualBlockAddr) -> Option<PageHandle> {
        let entry = self.pages.get(&addr)?;
        let handle = entry.value().clone();
        handle.pin();
        drop(entry);

        let mut state = handle.state();
        state.cursor = 0;
        state.touch();
        drop(state);
        Some(handle)
    }

    /// Pin the page at `addr`, reading it from the partition file on a miss.
    pub fn acquire(&self, addr: VirtualBlockAddr, io: &PartitionIo) -> Result<PageHandle> {
        self.check_partition(addr)?;
        self.metrics.count(Metric::PageRequests);
        if let Some(handle) = self.pin_cached(addr) {
            return Ok(handle);
        }

        self.metrics.count(Metric::PageCacheMisses);
        if self.pages.len() >= self.budget {
            self.evict_idle(Duration::ZERO);
        }

        let page = {
            let _timer = self.metrics.record(Metric::PageFetchTime);
            io.seek_read(addr.block())?
        };
        let page = Datablock::from_page(&page).map_err(|e| StoreError::StorageIo {
            partition: self.partition,
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("block {addr}: {e}"),
            ),
        })?;

        match self.pages.entry(addr) {
            // Another thread read the page in the meantime.
            Entry::Occupied(entry) => {
                let handle = entry.get().clone();
                handle.pin();
                drop(entry);
                handle.state().cursor = 0;
                Ok(handle)
            }
            Entry::Vacant(entry) => {
                let handle = PageHandle::new(addr, page, false);
                entry.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Pin a fresh empty page on a newly allocated block.
    ///
    /// The page starts dirty, so its empty image is logged and written like any other change. A
    /// block whose cached page is pinned, dirty or not empty is in use: it stays out of the free
    /// set and another block is allocated.
    pub fn acquire_new(&self, io: &PartitionIo) -> Result<PageHandle> {
        self.metrics.count(Metric::PageRequests);
        loop {
            let block = io.allocate()?;
            let addr = VirtualBlockAddr::new(self.partition, block);
            let handle = PageHandle::new(addr, Datablock::empty(self.page_size), true);
            match self.pages.entry(addr) {
                Entry::Occupied(mut entry) => {
                    let cached = entry.get();
                    let in_use = cached.pins() > 0 || {
                        let state = cached.state();
                        state.in_core || !state.page.header().is_empty()
                    };
                    if in_use {
                        tracing::debug!(%addr, "allocated block is cached and in use");
                        continue;
                    }
                    cached.discard();
                    entry.insert(handle.clone());
                }
                Entry::Vacant(entry) => {
                    entry.insert(handle.clone());
                }
            }
            return Ok(handle);
        }
    }

    /// Remove clean, unpinned pages idle for longer than `ttl`. Returns how many were removed.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let mut evicted = 0;
        self.pages.retain(|_, handle| {
            if handle.pins() > 0 {
                return true;
            }
            // A locked page is in use.
            let Some(mut state) = handle.try_state() else {
                return true;
            };
            if state.in_core || state.last_access.elapsed() < ttl {
                return true;
            }
            state.discarded = true;
            evicted += 1;
            false
        });
        if evicted > 0 {
            self.metrics.count_n(Metric::PagesEvicted, evicted as u64);
            tracing::trace!(partition = self.partition, evicted, "evicted idle pages");
        }
        evicted
    }

    /// Drop every cached page without writing anything, clearing all pins.
    ///
    /// Handles held by callers become unusable. Returns the number of dirty pages discarded.
    pub fn force_clear(&self) -> usize {
        let mut dirty = 0;
        self.pages.retain(|_, handle| {
            if handle.is_dirty() {
                dirty += 1;
            }
            handle.discard();
            false
        });
        dirty
    }

    /// A snapshot of the dirty pages.
    pub fn dirty_pages(&self) -> Vec<PageHandle> {
        self.pages
            .iter()
            .filter(|entry| entry.value().is_dirty())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// The blocks of every cached page.
    pub fn cached_blocks(&self) -> HashSet<u64> {
        self.pages.iter().map(|entry| entry.key().block()).collect()
    }

    /// Whether the page at `addr` is cached.
    pub fn contains(&self, addr: VirtualBlockAddr) -> bool {
        self.pages.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{failpoint::Failpoints, options::BackingMode};

    fn setup(partition: u8, budget: usize) -> (tempfile::TempDir, PartitionIo, BufferPool) {
        let dir = tempfile::tempdir().unwrap();
        let io = PartitionIo::open(
            dir.path(),
            partition,
            BackingMode::PlainFile,
            512,
            8,
            Failpoints::new(),
        )
        .unwrap();
        let pool = BufferPool::new(partition, 512, budget, Metrics::new(true));
        (dir, io, pool)
    }

    #[test]
    fn hit_pins_again_and_resets_cursor() {
        let (_dir, io, pool) = setup(1, 16);
        let addr = VirtualBlockAddr::new(1, 3);
        let a = pool.acquire(addr, &io).unwrap();
        a.seek(40).unwrap();
        let b = pool.acquire(addr, &io).unwrap();
        assert!(a.same_page(&b));
        assert_eq!(a.pins(), 2);
        assert_eq!(b.cursor(), 0);
        assert_eq!(pool.metrics.get(Metric::PageCacheMisses), Some(1));
        assert_eq!(pool.metrics.get(Metric::PageRequests), Some(2));
    }

    #[test]
    fn foreign_partition_is_rejected() {
        let (_dir, io, pool) = setup(1, 16);
        let err = pool.acquire(VirtualBlockAddr::new(2, 0), &io).unwrap_err();
        assert!(err.is_latch_violation());
    }

    #[test]
    fn acquire_new_is_dirty_and_pinned() {
        let (_dir, io, pool) = setup(0, 16);
        let handle = pool.acquire_new(&io).unwrap();
        assert_eq!(handle.addr(), VirtualBlockAddr::new(0, 1));
        assert_eq!(handle.pins(), 1);
        assert!(handle.is_dirty());
        assert!(!handle.is_logged());
        assert_eq!(pool.dirty_pages().len(), 1);
    }

    #[test]
    fn acquire_new_skips_cached_pages_in_use() {
        let (_dir, io, pool) = setup(1, 16);
        let dirty = pool.acquire(VirtualBlockAddr::new(1, 0), &io).unwrap();
        {
            let mut state = dirty.state();
            state.page.write_at(0, b"precious");
            state.mark_dirty();
        }
        dirty.unpin().unwrap();
        let pinned = pool.acquire(VirtualBlockAddr::new(1, 1), &io).unwrap();

        let fresh = pool.acquire_new(&io).unwrap();
        assert_eq!(fresh.addr(), VirtualBlockAddr::new(1, 2));
        assert!(pool.contains(dirty.addr()));
        assert!(dirty.is_dirty());
        assert_eq!(dirty.header().bytes_used, 8);
        assert_eq!(pinned.pins(), 1);
        assert!(pinned.pinned_state().is_ok());
    }

    #[test]
    fn acquire_new_recycles_a_clean_empty_cached_page() {
        let (_dir, io, pool) = setup(1, 16);
        let idle = pool.acquire(VirtualBlockAddr::new(1, 0), &io).unwrap();
        idle.unpin().unwrap();

        let fresh = pool.acquire_new(&io).unwrap();
        assert_eq!(fresh.addr(), idle.addr());
        assert!(!fresh.same_page(&idle));
        assert!(idle.pinned_state().is_err());
    }

    #[test]
    fn eviction_skips_pinned_and_dirty_pages() {
        let (_dir, io, pool) = setup(1, 16);
        let clean = pool.acquire(VirtualBlockAddr::new(1, 6), &io).unwrap();
        let pinned = pool.acquire(VirtualBlockAddr::new(1, 7), &io).unwrap();
        let dirty = pool.acquire_new(&io).unwrap();
        assert_eq!(dirty.addr().block(), 0);
        clean.unpin().unwrap();
        dirty.unpin().unwrap();

        assert_eq!(pool.evict_idle(Duration::from_secs(3600)), 0);
        assert_eq!(pool.evict_idle(Duration::ZERO), 1);
        assert!(!pool.contains(clean.addr()));
        assert!(pool.contains(pinned.addr()));
        assert!(pool.contains(dirty.addr()));
        assert!(clean.pinned_state().is_err());
    }

    #[test]
    fn miss_at_budget_sweeps_first() {
        let (_dir, io, pool) = setup(1, 2);
        for block in 0..2 {
            let h = pool.acquire(VirtualBlockAddr::new(1, block), &io).unwrap();
            h.unpin().unwrap();
        }
        assert_eq!(pool.len(), 2);
        let _h = pool.acquire(VirtualBlockAddr::new(1, 2), &io).unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.metrics.get(Metric::PagesEvicted), Some(2));
    }

    #[test]
    fn force_clear_discards_everything() {
        let (_dir, io, pool) = setup(1, 16);
        let clean = pool.acquire(VirtualBlockAddr::new(1, 5), &io).unwrap();
        let dirty = pool.acquire_new(&io).unwrap();
        assert_eq!(pool.force_clear(), 1);
        assert!(pool.is_empty());
        assert_eq!(clean.pins(), 0);
        assert!(dirty.pinned_state().unwrap_err().is_latch_violation());
    }
}
