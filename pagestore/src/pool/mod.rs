//! The pool orchestrator: routes page operations to their partition and runs the global
//! operations as one task per partition on a shared thread pool.
//!
//! Commit, rollback and checkpoint are serialized against each other. Page operations are not
//! blocked by them, but a page that is pinned while a global operation runs is left alone by it.
//! The one exception is logging: a commit holds every partition's log epoch from its first flush
//! until the logs are pruned, so no before-image can be appended to a log that is about to go.

use parking_lot::Mutex;
use pagestore_core::VirtualBlockAddr;
use std::{fs::File, sync::Arc};
use threadpool::ThreadPool;

use crate::{
    alloc::PartitionChooser,
    buffer_pool::PageHandle,
    error::{Result, StoreError},
    failpoint::Failpoints,
    meta::Meta,
    metrics::{Metric, Metrics},
    options::PartitionPolicy,
    recovery::{LogRecord, RecoveryReport},
    seglog::RecordId,
    task::fan_out,
};

mod cursor;
pub mod tablespace;

pub use self::tablespace::Tablespace;

pub struct Pool {
    tablespaces: Arc<Vec<Tablespace>>,
    thread_pool: ThreadPool,
    chooser: PartitionChooser,
    meta_fd: File,
    meta: Mutex<Meta>,
    /// Serializes commit, rollback and checkpoint.
    global: Mutex<()>,
    failpoints: Failpoints,
    metrics: Metrics,
}

impl Pool {
    pub fn new(
        tablespaces: Vec<Tablespace>,
        policy: PartitionPolicy,
        meta_fd: File,
        meta: Meta,
        failpoints: Failpoints,
        metrics: Metrics,
    ) -> Self {
        let high_water = tablespaces.iter().map(|ts| ts.io.high_water()).collect();
        let thread_pool = threadpool::Builder::new()
            .num_threads(tablespaces.len())
            .thread_name("pagestore-partition".into())
            .build();
        for ts in &tablespaces {
            *ts.log_epoch.write() = meta.epoch();
        }
        Self {
            tablespaces: Arc::new(tablespaces),
            thread_pool,
            chooser: PartitionChooser::new(policy, high_water),
            meta_fd,
            meta: Mutex::new(meta),
            global: Mutex::new(()),
            failpoints,
            metrics,
        }
    }

    pub fn partitions(&self) -> usize {
        self.tablespaces.len()
    }

    /// The epoch of the running transaction.
    pub fn epoch(&self) -> u64 {
        self.meta.lock().epoch()
    }

    /// The sequence number of the last commit.
    pub fn commit_seqn(&self) -> u64 {
        self.meta.lock().commit_seqn
    }

    pub fn tablespace(&self, partition: u8) -> Option<&Tablespace> {
        self.tablespaces.get(partition as usize)
    }

    /// The tablespace an address lives in.
    pub fn route(&self, addr: VirtualBlockAddr) -> Result<&Tablespace> {
        self.tablespace(addr.partition())
            .ok_or_else(|| StoreError::latch(addr, "partition does not exist"))
    }

    pub fn acquire(&self, addr: VirtualBlockAddr) -> Result<PageHandle> {
        self.route(addr)?.acquire(addr)
    }

    /// Pin a fresh page in `partition`, or in the partition picked by the allocation policy.
    pub fn acquire_new(&self, partition: Option<u8>) -> Result<PageHandle> {
        let partition = partition.unwrap_or_else(|| self.chooser.choose());
        let ts = self.tablespace(partition).ok_or_else(|| {
            StoreError::Config(format!(
                "partition {partition} out of range, the store has {}",
                self.partitions()
            ))
        })?;
        ts.acquire_new()
    }

    /// Run `task` on every tablespace in parallel, returning the results in partition order or
    /// the error of the lowest failing partition.
    fn for_each_partition<F, R>(&self, task: F) -> Result<Vec<R>>
    where
        F: Fn(&Tablespace) -> Result<R> + Send + Sync + 'static,
        R: Send + 'static,
    {
        let tablespaces = self.tablespaces.clone();
        fan_out(&self.thread_pool, tablespaces.len(), move |partition| {
            task(&tablespaces[partition as usize])
        })
        .into_iter()
        .collect()
    }

    /// Run recovery on every partition in parallel. `records` holds the log records found by
    /// [`crate::recovery::RecoveryLog::open`] for each partition, in partition order.
    ///
    /// Restored pages may be empty again, so the free block sets are rebuilt afterwards.
    pub fn recover_all(
        &self,
        records: Vec<Vec<(RecordId, LogRecord)>>,
    ) -> Result<Vec<RecoveryReport>> {
        assert_eq!(records.len(), self.partitions());
        let committed_seqn = self.commit_seqn();
        let records: Vec<Mutex<Vec<(RecordId, LogRecord)>>> =
            records.into_iter().map(Mutex::new).collect();
        let records = Arc::new(records);
        self.for_each_partition(move |ts| {
            let records = std::mem::take(&mut *records[ts.partition as usize].lock());
            let report = ts.log.lock().recover(&ts.io, records, committed_seqn)?;
            ts.io.rescan_free(ts.buffers.cached_blocks())?;
            Ok(report)
        })
    }

    /// Make every change of the running transaction durable.
    ///
    /// Every partition flushes its unpinned dirty pages and forces its file. Then the metadata
    /// file is rewritten with the next commit sequence number, which is the commit point, and
    /// finally the recovery logs are discarded.
    pub fn commit_all(&self) -> Result<()> {
        let _global = self.global.lock();
        let _timer = self.metrics.record(Metric::CommitTime);
        let mut log_epochs: Vec<_> = self
            .tablespaces
            .iter()
            .map(|ts| ts.log_epoch.write())
            .collect();

        let mut meta = self.meta.lock().clone();
        let epoch = meta.epoch();
        let flushed: usize = self
            .for_each_partition(move |ts| {
                let flushed = ts.flush_dirty(epoch)?;
                ts.io.force()?;
                Ok(flushed)
            })?
            .into_iter()
            .sum();

        meta.commit_seqn = epoch;
        Meta::write(&self.meta_fd, &meta, &self.failpoints)?;
        *self.meta.lock() = meta;
        for log_epoch in &mut log_epochs {
            **log_epoch = epoch + 1;
        }

        self.for_each_partition(move |ts| ts.log.lock().commit(epoch))?;
        tracing::debug!(commit_seqn = epoch, flushed, "committed");
        Ok(())
    }

    /// Undo every change of the running transaction.
    ///
    /// All cached pages are dropped, including pinned ones: their handles become unusable. The
    /// before-images are written back and the free block sets are rebuilt from the restored
    /// files.
    pub fn rollback_all(&self) -> Result<()> {
        let _global = self.global.lock();
        let restored: usize = self
            .for_each_partition(|ts| {
                ts.buffers.force_clear();
                let restored = ts.log.lock().rollback(&ts.io)?;
                ts.io.rescan_free(ts.buffers.cached_blocks())?;
                Ok(restored)
            })?
            .into_iter()
            .sum();
        tracing::debug!(restored, "rolled back");
        Ok(())
    }

    /// Flush every unpinned dirty page and mark the recovery logs with a checkpoint.
    ///
    /// The transaction stays open: a later rollback still restores the pre-transaction images.
    pub fn checkpoint_all(&self) -> Result<()> {
        let _global = self.global.lock();
        let epoch = self.epoch();
        let flushed: usize = self
            .for_each_partition(move |ts| {
                let flushed = ts.flush_dirty(epoch)?;
                ts.io.force()?;
                ts.log.lock().checkpoint(epoch)?;
                Ok(flushed)
            })?
            .into_iter()
            .sum();
        tracing::debug!(epoch, flushed, "checkpoint");
        Ok(())
    }

    /// Drop every cached page without writing anything.
    pub fn force_clear_all(&self) -> Result<()> {
        let dirty: usize = self
            .for_each_partition(|ts| Ok(ts.buffers.force_clear()))?
            .into_iter()
            .sum();
        if dirty > 0 {
            tracing::warn!(dirty, "force clear discarded dirty pages");
        }
        Ok(())
    }

    /// Remove pages idle for longer than `ttl` from every buffer pool.
    pub fn evict_idle(&self, ttl: std::time::Duration) -> usize {
        self.tablespaces
            .iter()
            .map(|ts| ts.buffers.evict_idle(ttl))
            .sum()
    }

    /// Stop every partition's I/O worker. Later requests fail.
    pub fn close(&self) {
        for ts in self.tablespaces.iter() {
            ts.io.close();
        }
    }
}
