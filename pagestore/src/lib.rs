//! A partitioned page store.
//!
//! Pages of a fixed size live in up to eight partition files, each served by its own I/O thread.
//! Pages are cached in latched buffer pools and handed out as pinned [`PageHandle`]s. Changes are
//! made durable by [`Pagestore::commit`] and undone by [`Pagestore::rollback`]; before a changed
//! page reaches its partition file, its previous image is appended to the partition's recovery
//! log, which is replayed when a store is reopened after a crash.

use anyhow::Context as _;
use std::{
    fs::{File, OpenOptions},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    buffer_pool::BufferPool,
    flock::Flock,
    io::PartitionIo,
    meta::Meta,
    pool::{Pool, Tablespace},
    recovery::RecoveryLog,
    sweeper::Sweeper,
};

pub use crate::{
    buffer_pool::{Datablock, PageHandle},
    error::{Result, StoreError},
    failpoint::{Failpoints, LOG_APPEND, META_WRITE, PAGE_WRITE},
    metrics::{Metric, Metrics},
    options::{BackingMode, Options, PartitionPolicy},
    recovery::{LogState, RecoveryReport},
};
pub use pagestore_core::{GroupTag, PageHeader, VirtualBlockAddr, HEADER_SIZE};

mod alloc;
mod buffer_pool;
mod error;
mod failpoint;
mod flock;
mod io;
mod meta;
mod metrics;
mod options;
mod pool;
mod recovery;
mod seglog;
mod sweeper;
mod task;

/// The page-access contract of the store.
///
/// Every handle argument must be pinned: operations on a released handle, or on one dropped from
/// the buffer pool by a rollback or a force-clear, fail with [`StoreError::LatchViolation`].
pub trait PageAccess {
    /// Pin the page at `addr`, reading it on a cache miss. The cursor starts at 0.
    fn acquire_page(&self, addr: VirtualBlockAddr) -> Result<PageHandle>;
    /// Pin an empty page on a newly allocated block, in `partition` if given.
    fn acquire_new_page(&self, partition: Option<u8>) -> Result<PageHandle>;
    /// Drop one pin.
    fn release(&self, handle: &PageHandle) -> Result<()>;
    /// Mark the page as changed.
    fn mark_dirty(&self, handle: &PageHandle) -> Result<()>;

    /// Read `len` payload bytes at `offset`.
    fn read_at(&self, handle: &PageHandle, offset: usize, len: usize) -> Result<Vec<u8>>;
    /// Write `data` into the payload at `offset`.
    fn write_at(&self, handle: &PageHandle, offset: usize, data: &[u8]) -> Result<()>;
    /// Zero `len` payload bytes at `offset`.
    fn delete_at(&self, handle: &PageHandle, offset: usize, len: usize) -> Result<()>;

    /// Write `data` at the cursor, continuing on the next page of the chain, which is allocated
    /// when missing. `handle` ends up on the page holding the last written byte.
    fn write_bytes(&self, handle: &mut PageHandle, data: &[u8]) -> Result<()>;
    /// Read used bytes from the cursor on, following the chain. Returns the number of bytes read.
    fn read_bytes(&self, handle: &mut PageHandle, buf: &mut [u8]) -> Result<usize>;
    /// Delete up to `len` used bytes from the cursor on, following the chain. Returns the number
    /// of bytes deleted.
    fn delete_bytes(&self, handle: &mut PageHandle, len: usize) -> Result<usize>;
    /// Release `handle` and pin the next page of its chain, if any.
    fn next(&self, handle: PageHandle) -> Result<Option<PageHandle>>;

    /// Make every change since the last commit or rollback durable.
    fn commit(&self) -> Result<()>;
    /// Undo every change since the last commit or rollback.
    fn rollback(&self) -> Result<()>;
    /// Write changed pages out early while keeping the transaction open.
    fn checkpoint(&self) -> Result<()>;
    /// Drop every cached page without writing anything.
    fn force_clear(&self) -> Result<()>;
}

/// An open store.
///
/// The store is closed when dropped. Share it between threads behind an [`Arc`].
pub struct Pagestore {
    pool: Arc<Pool>,
    sweeper: Mutex<Option<Sweeper>>,
    options: Options,
    failpoints: Failpoints,
    metrics: Metrics,
    _flock: Flock,
}

impl std::fmt::Debug for Pagestore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pagestore")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Pagestore {
    /// Open the store in the directory given by the options, creating it if missing.
    ///
    /// Changes left behind by a transaction that did not commit are rolled back before this
    /// returns.
    pub fn open(options: Options) -> Result<Self> {
        options.validate()?;
        let dir = options.path.clone();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let flock = Flock::lock(&dir, ".lock")?;

        let failpoints = Failpoints::new();
        let metrics = Metrics::new(options.metrics);

        let meta_fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join("meta"))
            .context("failed to open the metadata file")?;
        let meta = if meta_fd.metadata().context("metadata file")?.len() == 0 {
            let meta = Meta::new(options.page_size as u32, options.partitions as u32);
            Meta::write(&meta_fd, &meta, &failpoints)?;
            meta
        } else {
            let meta = Meta::read(&meta_fd)?;
            check_meta(&meta, &options)?;
            meta
        };

        let dir_fd = Arc::new(File::open(&dir).context("failed to open the database directory")?);
        let mut tablespaces = Vec::with_capacity(options.partitions);
        let mut records = Vec::with_capacity(options.partitions);
        for partition in 0..options.partitions as u8 {
            let io = PartitionIo::open(
                &dir,
                partition,
                options.backing_mode,
                options.page_size,
                options.extend_batch,
                failpoints.clone(),
            )?;
            let (log, found) = RecoveryLog::open(
                &dir,
                dir_fd.clone(),
                partition,
                options.max_log_segment_size,
                failpoints.clone(),
                metrics.clone(),
            )?;
            let buffers = BufferPool::new(
                partition,
                options.page_size,
                options.pages_per_partition(),
                metrics.clone(),
            );
            tablespaces.push(Tablespace::new(buffers, log, io, metrics.clone()));
            records.push(found);
        }
        dir_fd.sync_all().context("failed to sync the database directory")?;

        let pool = Arc::new(Pool::new(
            tablespaces,
            options.partition_policy,
            meta_fd,
            meta,
            failpoints.clone(),
            metrics.clone(),
        ));
        let reports = pool.recover_all(records)?;
        let undone: usize = reports.iter().map(|r| r.undone).sum();

        let sweeper = Sweeper::start(pool.clone(), options.sweep_interval, options.cache_ttl)
            .context("failed to start the idle sweeper")?;

        tracing::info!(
            path = %dir.display(),
            partitions = options.partitions,
            page_size = options.page_size,
            commit_seqn = pool.commit_seqn(),
            undone,
            "opened pagestore"
        );

        Ok(Self {
            pool,
            sweeper: Mutex::new(Some(sweeper)),
            options,
            failpoints,
            metrics,
            _flock: flock,
        })
    }

    /// Stop the idle sweeper and every partition worker. Later operations fail.
    ///
    /// Nothing is flushed: uncommitted changes are rolled back when the store is next opened.
    pub fn close(&self) {
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
            self.pool.close();
            tracing::debug!(path = %self.options.path.display(), "closed pagestore");
        }
    }

    /// The options the store was opened with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The fault-injection points of this store.
    pub fn failpoints(&self) -> &Failpoints {
        &self.failpoints
    }

    /// The metrics collected by this store.
    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    /// The sequence number of the last commit.
    pub fn commit_seqn(&self) -> u64 {
        self.pool.commit_seqn()
    }

    /// The state of the recovery log of `partition`.
    pub fn log_state(&self, partition: u8) -> Option<LogState> {
        self.pool
            .tablespace(partition)
            .map(|ts| ts.log.lock().state())
    }

    /// Whether the page at `addr` is in its buffer pool.
    pub fn is_cached(&self, addr: VirtualBlockAddr) -> bool {
        self.pool
            .route(addr)
            .map_or(false, |ts| ts.buffers.contains(addr))
    }

    /// Write a changed page through to its partition file, logging its previous image first.
    /// Returns whether anything was written.
    pub fn flush_page(&self, handle: &PageHandle) -> Result<bool> {
        self.pool
            .route(handle.addr())?
            .flush_page(handle)
    }

    /// Write a page to its partition file as is. Fails with [`StoreError::LatchViolation`] if
    /// the page has changes whose previous image is not logged yet.
    pub fn write_page(&self, handle: &PageHandle) -> Result<()> {
        self.pool.route(handle.addr())?.write_page(handle)
    }

    /// Run an idle sweep right away. Returns the number of evicted pages.
    pub fn evict_idle(&self) -> usize {
        self.pool.evict_idle(self.options.cache_ttl)
    }
}

fn check_meta(meta: &Meta, options: &Options) -> Result<()> {
    if meta.page_size as usize != options.page_size {
        return Err(StoreError::Config(format!(
            "store was created with page size {}, opened with {}",
            meta.page_size, options.page_size
        )));
    }
    if meta.partitions as usize != options.partitions {
        return Err(StoreError::Config(format!(
            "store was created with {} partitions, opened with {}",
            meta.partitions, options.partitions
        )));
    }
    Ok(())
}

impl PageAccess for Pagestore {
    fn acquire_page(&self, addr: VirtualBlockAddr) -> Result<PageHandle> {
        self.pool.acquire(addr)
    }

    fn acquire_new_page(&self, partition: Option<u8>) -> Result<PageHandle> {
        self.pool.acquire_new(partition)
    }

    fn release(&self, handle: &PageHandle) -> Result<()> {
        self.pool
            .route(handle.addr())?
            .release(handle)
    }

    fn mark_dirty(&self, handle: &PageHandle) -> Result<()> {
        self.pool.route(handle.addr())?.mark_dirty(handle)
    }

    fn read_at(&self, handle: &PageHandle, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.pool.route(handle.addr())?.read_at(handle, offset, len)
    }

    fn write_at(&self, handle: &PageHandle, offset: usize, data: &[u8]) -> Result<()> {
        self.pool.route(handle.addr())?.write_at(handle, offset, data)
    }

    fn delete_at(&self, handle: &PageHandle, offset: usize, len: usize) -> Result<()> {
        self.pool.route(handle.addr())?.delete_at(handle, offset, len)
    }

    fn write_bytes(&self, handle: &mut PageHandle, data: &[u8]) -> Result<()> {
        let ts = self.pool.route(handle.addr())?;
        ts.write_bytes(handle, data)
    }

    fn read_bytes(&self, handle: &mut PageHandle, buf: &mut [u8]) -> Result<usize> {
        let ts = self.pool.route(handle.addr())?;
        ts.read_bytes(handle, buf)
    }

    fn delete_bytes(&self, handle: &mut PageHandle, len: usize) -> Result<usize> {
        let ts = self.pool.route(handle.addr())?;
        ts.delete_bytes(handle, len)
    }

    fn next(&self, handle: PageHandle) -> Result<Option<PageHandle>> {
        let ts = self.pool.route(handle.addr())?;
        ts.next(handle)
    }

    fn commit(&self) -> Result<()> {
        self.pool.commit_all()
    }

    fn rollback(&self) -> Result<()> {
        self.pool.rollback_all()
    }

    fn checkpoint(&self) -> Result<()> {
        self.pool.checkpoint_all()
    }

    fn force_clear(&self) -> Result<()> {
        self.pool.force_clear_all()
    }
}

impl Drop for Pagestore {
    fn drop(&mut self) {
        self.close();
    }
}
