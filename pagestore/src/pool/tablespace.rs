//! One partition's buffer pool, recovery log and I/O worker, and the page operations that need
//! all three.

use parking_lot::{Mutex, RwLock};
use pagestore_core::VirtualBlockAddr;

use crate::{
    buffer_pool::{handle::PageState, BufferPool, PageHandle},
    error::{Result, StoreError},
    io::PartitionIo,
    metrics::{Metric, Metrics},
    recovery::RecoveryLog,
};

pub struct Tablespace {
    pub(crate) partition: u8,
    pub(crate) buffers: BufferPool,
    pub(crate) log: Mutex<RecoveryLog>,
    pub(crate) io: PartitionIo,
    /// The epoch of the running transaction. Held shared by page operations that append to the
    /// log, and exclusively by a commit from its first flush to the prune of the log.
    pub(crate) log_epoch: RwLock<u64>,
    metrics: Metrics,
}

impl Tablespace {
    pub fn new(buffers: BufferPool, log: RecoveryLog, io: PartitionIo, metrics: Metrics) -> Self {
        Self {
            partition: io.partition(),
            buffers,
            log: Mutex::new(log),
            io,
            log_epoch: RwLock::new(1),
            metrics,
        }
    }

    /// Durably log the before-image of a dirty page and stamp the page with the record id.
    fn log_page(&self, addr: VirtualBlockAddr, state: &mut PageState, epoch: u64) -> Result<()> {
        let record_id = self.log.lock().write_log(&self.io, addr.block(), epoch)?;
        state.page.header_mut().page_lsn = Some(record_id.0);
        state.in_log = true;
        Ok(())
    }

    /// Write a locked page to the partition file. The page must not be dirty without a logged
    /// before-image.
    fn write_locked(&self, addr: VirtualBlockAddr, state: &mut PageState) -> Result<()> {
        if state.in_core && !state.in_log {
            return Err(StoreError::latch(
                addr,
                "write of a dirty page without a logged before-image",
            ));
        }
        self.io.seek_write(addr.block(), state.page.to_page())?;
        state.in_core = false;
        state.in_log = false;
        self.metrics.count(Metric::PagesFlushed);
        Ok(())
    }

    /// Write a page straight to its partition file without logging it first.
    pub fn write_page(&self, handle: &PageHandle) -> Result<()> {
        let mut state = handle.pinned_state()?;
        self.write_locked(handle.addr(), &mut state)
    }

    /// Write a dirty page through to its partition file, logging its before-image first if that
    /// has not happened yet. Returns whether anything was written.
    pub fn flush_page(&self, handle: &PageHandle) -> Result<bool> {
        let epoch = self.log_epoch.read();
        let mut state = handle.state();
        if state.discarded {
            return Err(StoreError::latch(
                handle.addr(),
                "handle was dropped from the buffer pool",
            ));
        }
        self.flush_locked(handle.addr(), &mut state, *epoch)
    }

    fn flush_locked(
        &self,
        addr: VirtualBlockAddr,
        state: &mut PageState,
        epoch: u64,
    ) -> Result<bool> {
        if !state.in_core {
            return Ok(false);
        }
        if !state.in_log {
            self.log_page(addr, state, epoch)?;
        }
        self.write_locked(addr, state)?;
        Ok(true)
    }

    /// Flush every dirty, unpinned page. Pinned dirty pages stay cached; their before-image is
    /// marked as no longer logged since the log is about to be discarded or checkpointed.
    ///
    /// The caller holds `log_epoch` exclusively when the log is to be discarded. Returns the
    /// number of pages written.
    pub fn flush_dirty(&self, epoch: u64) -> Result<usize> {
        let mut flushed = 0;
        for handle in self.buffers.dirty_pages() {
            let mut state = handle.state();
            if state.discarded {
                continue;
            }
            if handle.pins() == 0 {
                if self.flush_locked(handle.addr(), &mut state, epoch)? {
                    flushed += 1;
                }
            } else {
                state.in_log = false;
            }
        }
        Ok(flushed)
    }

    pub fn acquire(&self, addr: VirtualBlockAddr) -> Result<PageHandle> {
        self.buffers.acquire(addr, &self.io)
    }

    pub fn acquire_new(&self) -> Result<PageHandle> {
        self.buffers.acquire_new(&self.io)
    }

    /// Drop one pin. Dropping the last pin of a dirty, unlogged page logs its before-image first.
    ///
    /// If logging fails the pin is kept: a dirty page never loses its last pin before its
    /// before-image is durable.
    pub fn release(&self, handle: &PageHandle) -> Result<()> {
        let epoch = self.log_epoch.read();
        let mut state = handle.pinned_state()?;
        if handle.pins() == 1 && state.in_core && !state.in_log {
            self.log_page(handle.addr(), &mut state, *epoch)?;
        }
        handle.unpin()?;
        state.touch();
        Ok(())
    }

    pub fn mark_dirty(&self, handle: &PageHandle) -> Result<()> {
        handle.pinned_state()?.mark_dirty();
        Ok(())
    }

    pub fn read_at(&self, handle: &PageHandle, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut state = handle.pinned_state()?;
        let mut buf = vec![0u8; len];
        if !state.page.read_at(offset, &mut buf) {
            return Err(out_of_bounds(handle, offset, len));
        }
        state.touch();
        Ok(buf)
    }

    pub fn write_at(&self, handle: &PageHandle, offset: usize, data: &[u8]) -> Result<()> {
        let mut state = handle.pinned_state()?;
        if !state.page.write_at(offset, data) {
            return Err(out_of_bounds(handle, offset, data.len()));
        }
        state.mark_dirty();
        Ok(())
    }

    pub fn delete_at(&self, handle: &PageHandle, offset: usize, len: usize) -> Result<()> {
        let mut state = handle.pinned_state()?;
        if !state.page.delete_at(offset, len) {
            return Err(out_of_bounds(handle, offset, len));
        }
        state.mark_dirty();
        Ok(())
    }
}

fn out_of_bounds(handle: &PageHandle, offset: usize, len: usize) -> StoreError {
    StoreError::OutOfBounds {
        addr: handle.addr(),
        offset,
        len,
    }
}
