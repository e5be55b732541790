use std::{path::PathBuf, time::Duration};

use pagestore_core::{block_addr::MAX_PARTITIONS, page};

use crate::error::{Result, StoreError};

/// Options when opening a [`crate::Pagestore`] instance.
#[derive(Clone, Debug)]
pub struct Options {
    /// The path to the directory where the database is stored.
    pub(crate) path: PathBuf,
    /// The number of partitions. Between 1 and 8.
    pub(crate) partitions: usize,
    /// The size of a page in bytes. A power of two between 512 and 32768.
    pub(crate) page_size: usize,
    /// The total number of pages the buffer pools may hold, split evenly across partitions.
    pub(crate) buffer_pool_pages: usize,
    /// Clean, unpinned pages idle for longer than this are evicted by the sweeper.
    pub(crate) cache_ttl: Duration,
    /// How often the sweeper runs.
    pub(crate) sweep_interval: Duration,
    pub(crate) backing_mode: BackingMode,
    /// The number of blocks a partition grows by when it runs out of free blocks.
    pub(crate) extend_batch: u64,
    pub(crate) partition_policy: PartitionPolicy,
    /// Soft limit on the size of a recovery log segment file.
    pub(crate) max_log_segment_size: u64,
    /// Enable or disable metrics collection.
    pub(crate) metrics: bool,
}

impl Options {
    /// Create a new `Options` instance with the default values.
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("pagestore_db"),
            partitions: 4,
            page_size: 4096,
            buffer_pool_pages: 16384,
            cache_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            backing_mode: BackingMode::PlainFile,
            extend_batch: 64,
            partition_policy: PartitionPolicy::RoundRobin,
            max_log_segment_size: 64 * 1024 * 1024,
            metrics: false,
        }
    }

    /// Set the path to the directory where the database is stored.
    pub fn path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    /// Set the number of partitions.
    ///
    /// Must be between 1 and 8. Fixed at creation: reopening with a different value fails.
    ///
    /// Default: 4.
    pub fn partitions(&mut self, partitions: usize) {
        self.partitions = partitions;
    }

    /// Set the page size in bytes.
    ///
    /// Must be a power of two between 512 and 32768. Fixed at creation.
    ///
    /// Default: 4096.
    pub fn page_size(&mut self, page_size: usize) {
        self.page_size = page_size;
    }

    /// Set the total number of pages held by the buffer pools.
    ///
    /// This is a soft budget: pinned and dirty pages are never evicted to honor it.
    ///
    /// Default: 16384.
    pub fn buffer_pool_pages(&mut self, buffer_pool_pages: usize) {
        self.buffer_pool_pages = buffer_pool_pages;
    }

    /// Set how long a clean, unpinned page may stay idle in the cache.
    ///
    /// Default: 30s.
    pub fn cache_ttl(&mut self, cache_ttl: Duration) {
        self.cache_ttl = cache_ttl;
    }

    /// Set how often the idle sweeper runs.
    ///
    /// Default: 5s.
    pub fn sweep_interval(&mut self, sweep_interval: Duration) {
        self.sweep_interval = sweep_interval;
    }

    /// Set how partition files are accessed.
    ///
    /// Default: [`BackingMode::PlainFile`].
    pub fn backing_mode(&mut self, backing_mode: BackingMode) {
        self.backing_mode = backing_mode;
    }

    /// Set the number of blocks a partition file grows by when its free list is empty.
    ///
    /// May not be zero.
    ///
    /// Default: 64.
    pub fn extend_batch(&mut self, extend_batch: u64) {
        self.extend_batch = extend_batch;
    }

    /// Set how new pages without a partition hint are spread across partitions.
    ///
    /// Default: [`PartitionPolicy::RoundRobin`].
    pub fn partition_policy(&mut self, partition_policy: PartitionPolicy) {
        self.partition_policy = partition_policy;
    }

    /// Set the soft limit on the size of a recovery log segment.
    ///
    /// Default: 64MiB.
    pub fn max_log_segment_size(&mut self, max_log_segment_size: u64) {
        self.max_log_segment_size = max_log_segment_size;
    }

    /// Set metrics collection on or off.
    ///
    /// Default: off.
    pub fn metrics(&mut self, metrics: bool) {
        self.metrics = metrics;
    }

    /// The configured database directory.
    pub fn get_path(&self) -> &std::path::Path {
        &self.path
    }

    /// The configured page size.
    pub fn get_page_size(&self) -> usize {
        self.page_size
    }

    /// The configured number of partitions.
    pub fn get_partitions(&self) -> usize {
        self.partitions
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.partitions == 0 || self.partitions > MAX_PARTITIONS {
            errors.push(format!(
                "partitions must be between 1 and {MAX_PARTITIONS}, got {}",
                self.partitions
            ));
        }
        if !page::is_valid_page_size(self.page_size) {
            errors.push(format!(
                "page_size must be a power of two between {} and {}, got {}",
                page::MIN_PAGE_SIZE,
                page::MAX_PAGE_SIZE,
                self.page_size
            ));
        }
        if self.extend_batch == 0 {
            errors.push("extend_batch may not be zero".to_string());
        }
        if self.sweep_interval.is_zero() {
            errors.push("sweep_interval may not be zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Config(errors.join("; ")))
        }
    }

    /// The page budget of a single partition's buffer pool.
    pub(crate) fn pages_per_partition(&self) -> usize {
        (self.buffer_pool_pages / self.partitions.max(1)).max(1)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

/// How a partition file is accessed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackingMode {
    /// Positional reads and writes on a plain file.
    PlainFile,
    /// A shared, writable memory mapping of the file, remapped whenever the file grows.
    MemoryMapped,
}

/// How the partition of a new page is chosen when the caller gives no hint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionPolicy {
    /// Cycle through the partitions.
    RoundRobin,
    /// Pick the partition with the smallest file.
    SmallestFirst,
}
