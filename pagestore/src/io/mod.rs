//! Partition I/O workers.
//!
//! Every partition file is served by one dedicated thread that owns the file and the partition's
//! free block set. Requests are sent over a private channel and executed in submission order; each
//! request carries its own reply channel and the caller blocks on it. Partitions are served in
//! parallel.
//!
//! All operations address partition-relative blocks. Translation from virtual block addresses
//! happens one layer up.

#[cfg(not(target_family = "unix"))]
std::compile_error!("pagestore only supports Unix-based OSs");

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use pagestore_core::page::{self, PageHeader, HEADER_SIZE};
use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use crate::{
    alloc::FreeBlocks,
    error::{Result, StoreError},
    failpoint::{self, Failpoints},
    options::BackingMode,
};

pub mod backing;

use self::backing::Backing;

/// The path of the data file of partition `partition`.
pub fn tablespace_path(dir: &Path, partition: u8) -> PathBuf {
    dir.join(format!("tablespace.{partition}"))
}

enum IoCommand {
    Read { block: u64, full: bool },
    Write { block: u64, page: Vec<u8>, full: bool },
    Extend { new_len: u64 },
    Force,
    Allocate,
    Rescan { exclude: HashSet<u64> },
}

enum IoReply {
    Page(Vec<u8>),
    Block(u64),
    /// The partition could not be extended to serve an allocation.
    Exhausted(io::Error),
    Done,
}

struct IoPacket {
    command: IoCommand,
    reply: Sender<io::Result<IoReply>>,
}

/// Handle to the I/O worker of one partition.
pub struct PartitionIo {
    partition: u8,
    sender: Mutex<Option<Sender<IoPacket>>>,
    /// The partition length in blocks, published by the worker after every extension.
    high_water: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionIo {
    /// Open or create the file of `partition` under `dir`, build its free block set and start its
    /// worker thread.
    pub fn open(
        dir: &Path,
        partition: u8,
        mode: BackingMode,
        page_size: usize,
        extend_batch: u64,
        failpoints: Failpoints,
    ) -> Result<Self> {
        let path = tablespace_path(dir, partition);
        let backing = backing::open(&path, mode).map_err(StoreError::io(partition))?;
        let high_water = Arc::new(AtomicU64::new(0));

        let mut worker = Worker {
            partition,
            page_size,
            backing,
            free: FreeBlocks::new(partition),
            extend_batch,
            high_water: high_water.clone(),
            failpoints,
        };
        worker.init().map_err(StoreError::io(partition))?;
        tracing::debug!(
            partition,
            path = %path.display(),
            len_blocks = worker.len_blocks(),
            free = worker.free.len(),
            "opened partition"
        );

        let (sender, receiver) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name(format!("pagestore-io-{partition}"))
            .spawn(move || worker.run(receiver))
            .map_err(StoreError::io(partition))?;

        Ok(Self {
            partition,
            sender: Mutex::new(Some(sender)),
            high_water,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn partition(&self) -> u8 {
        self.partition
    }

    fn request(&self, command: IoCommand) -> io::Result<IoReply> {
        let stopped = || io::Error::new(io::ErrorKind::BrokenPipe, "I/O worker stopped");
        let (reply, reply_rx) = crossbeam_channel::bounded(1);
        {
            let sender = self.sender.lock();
            let sender = sender.as_ref().ok_or_else(stopped)?;
            sender
                .send(IoPacket { command, reply })
                .map_err(|_| stopped())?;
        }
        reply_rx.recv().map_err(|_| stopped())?
    }

    fn request_page(&self, command: IoCommand) -> Result<Vec<u8>> {
        match self.request(command).map_err(StoreError::io(self.partition))? {
            IoReply::Page(page) => Ok(page),
            _ => unreachable!("read requests are answered with a page"),
        }
    }

    fn request_done(&self, command: IoCommand) -> Result<()> {
        self.request(command)
            .map(|_| ())
            .map_err(StoreError::io(self.partition))
    }

    /// Read the header and the used payload bytes of `block`. The rest of the page is zeroed.
    pub fn seek_read(&self, block: u64) -> Result<Vec<u8>> {
        self.request_page(IoCommand::Read { block, full: false })
    }

    /// Read the entire page of `block`.
    pub fn seek_read_full(&self, block: u64) -> Result<Vec<u8>> {
        self.request_page(IoCommand::Read { block, full: true })
    }

    /// Write the header and the used payload bytes of `page` to `block`.
    pub fn seek_write(&self, block: u64, page: Vec<u8>) -> Result<()> {
        self.request_done(IoCommand::Write {
            block,
            page,
            full: false,
        })
    }

    /// Write the entire `page` to `block`.
    pub fn seek_write_full(&self, block: u64, page: Vec<u8>) -> Result<()> {
        self.request_done(IoCommand::Write {
            block,
            page,
            full: true,
        })
    }

    /// Grow the partition to `new_len` blocks, initializing the new blocks as empty pages and
    /// adding them to the free set. Never shrinks.
    pub fn extend(&self, new_len: u64) -> Result<()> {
        self.request_done(IoCommand::Extend { new_len })
    }

    /// Durability barrier over every write issued before it.
    pub fn force(&self) -> Result<()> {
        self.request_done(IoCommand::Force)
    }

    /// The partition length in blocks.
    pub fn len_blocks(&self) -> u64 {
        self.high_water.load(Ordering::Acquire)
    }

    pub(crate) fn high_water(&self) -> Arc<AtomicU64> {
        self.high_water.clone()
    }

    /// Take the lowest free block, extending the partition if none is left.
    ///
    /// Only a failed extension is reported as [`StoreError::AllocationExhausted`].
    pub fn allocate(&self) -> Result<u64> {
        match self
            .request(IoCommand::Allocate)
            .map_err(StoreError::io(self.partition))?
        {
            IoReply::Block(block) => Ok(block),
            IoReply::Exhausted(source) => Err(StoreError::AllocationExhausted {
                partition: self.partition,
                source,
            }),
            _ => unreachable!("allocation requests are answered with a block"),
        }
    }

    /// Rebuild the free block set, skipping the blocks in `exclude`.
    pub fn rescan_free(&self, exclude: HashSet<u64>) -> Result<()> {
        self.request_done(IoCommand::Rescan { exclude })
    }

    /// Stop the worker thread after it drained the requests already queued. Idempotent.
    pub fn close(&self) {
        let _ = self.sender.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!(partition = self.partition, "I/O worker panicked");
            }
        }
    }
}

impl Drop for PartitionIo {
    fn drop(&mut self) {
        self.close();
    }
}

struct Worker {
    partition: u8,
    page_size: usize,
    backing: Box<dyn Backing>,
    free: FreeBlocks,
    extend_batch: u64,
    high_water: Arc<AtomicU64>,
    failpoints: Failpoints,
}

impl Worker {
    fn len_blocks(&self) -> u64 {
        self.backing.len() / self.page_size as u64
    }

    fn publish_len(&self) {
        self.high_water.store(self.len_blocks(), Ordering::Release);
    }

    fn init(&mut self) -> io::Result<()> {
        // A crash in the middle of an extension can leave a partial page at the end.
        let whole = self.len_blocks() * self.page_size as u64;
        if self.backing.len() != whole {
            tracing::warn!(
                partition = self.partition,
                len = self.backing.len(),
                "dropping partial page at the end of the partition"
            );
            self.backing.set_len(whole)?;
        }
        self.publish_len();
        self.rescan(&HashSet::new())?;
        if self.free.is_empty() {
            self.extend(self.len_blocks() + self.extend_batch)?;
            self.backing.sync()?;
        }
        Ok(())
    }

    fn run(mut self, receiver: Receiver<IoPacket>) {
        while let Ok(packet) = receiver.recv() {
            let result = self.execute(packet.command);
            let _ = packet.reply.send(result);
        }
    }

    fn execute(&mut self, command: IoCommand) -> io::Result<IoReply> {
        match command {
            IoCommand::Read { block, full } => self.read(block, full).map(IoReply::Page),
            IoCommand::Write { block, page, full } => {
                self.write(block, &page, full).map(|_| IoReply::Done)
            }
            IoCommand::Extend { new_len } => self.extend(new_len).map(|_| IoReply::Done),
            IoCommand::Force => self.backing.sync().map(|_| IoReply::Done),
            IoCommand::Allocate => self.allocate(),
            IoCommand::Rescan { exclude } => self.rescan(&exclude).map(|_| IoReply::Done),
        }
    }

    fn check_block(&self, block: u64) -> io::Result<u64> {
        if block >= self.len_blocks() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "block {block} beyond the end of partition {} ({} blocks)",
                    self.partition,
                    self.len_blocks()
                ),
            ));
        }
        Ok(block * self.page_size as u64)
    }

    fn read_header(&self, block: u64) -> io::Result<PageHeader> {
        let offset = self.check_block(block)?;
        let mut raw = [0u8; HEADER_SIZE];
        self.backing.read_at(&mut raw, offset)?;
        PageHeader::decode(&raw).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("block {block} of partition {}: {e}", self.partition),
            )
        })
    }

    fn read(&self, block: u64, full: bool) -> io::Result<Vec<u8>> {
        let offset = self.check_block(block)?;
        let mut page = vec![0u8; self.page_size];
        let len = if full {
            self.page_size
        } else {
            let header = self.read_header(block)?;
            HEADER_SIZE + header.bytes_used as usize
        };
        self.backing.read_at(&mut page[..len], offset)?;
        Ok(page)
    }

    fn write(&mut self, block: u64, page: &[u8], full: bool) -> io::Result<()> {
        self.failpoints.maybe_fail(failpoint::PAGE_WRITE)?;
        if page.len() != self.page_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("page of {} bytes, expected {}", page.len(), self.page_size),
            ));
        }
        let offset = self.check_block(block)?;
        let len = if full {
            self.page_size
        } else {
            let header = PageHeader::decode(page)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
            (HEADER_SIZE + header.bytes_used as usize).min(self.page_size)
        };
        self.backing.write_at(&page[..len], offset)?;
        // A block written with data is no longer free, however it was addressed.
        if PageHeader::decode(page).map_or(false, |h| !h.is_empty()) && self.free.claim(block) {
            tracing::trace!(partition = self.partition, block, "claimed free block");
        }
        Ok(())
    }

    fn extend(&mut self, new_len: u64) -> io::Result<()> {
        let old_len = self.len_blocks();
        if new_len <= old_len {
            return Ok(());
        }
        self.backing.set_len(new_len * self.page_size as u64)?;
        let empty = page::empty_page(self.page_size);
        for block in old_len..new_len {
            self.backing
                .write_at(&empty[..HEADER_SIZE], block * self.page_size as u64)?;
        }
        self.free.add_range(old_len, new_len);
        self.publish_len();
        tracing::debug!(
            partition = self.partition,
            old_len,
            new_len,
            "extended partition"
        );
        Ok(())
    }

    fn allocate(&mut self) -> io::Result<IoReply> {
        loop {
            if self.free.is_empty() {
                if let Err(err) = self.extend(self.len_blocks() + self.extend_batch) {
                    return Ok(IoReply::Exhausted(err));
                }
            }
            let Some(block) = self.free.pop() else {
                return Ok(IoReply::Exhausted(io::Error::new(
                    io::ErrorKind::Other,
                    "no free block after extension",
                )));
            };
            if self.read_header(block)?.is_empty() {
                return Ok(IoReply::Block(block));
            }
            tracing::warn!(
                partition = self.partition,
                block,
                "skipping free block that stores data"
            );
        }
    }

    fn rescan(&mut self, exclude: &HashSet<u64>) -> io::Result<()> {
        let len = self.len_blocks();
        let mut free = FreeBlocks::new(self.partition);
        free.rescan(len, exclude, |block| {
            self.read_header(block).map(|h| h.is_empty())
        })?;
        self.free = free;
        Ok(())
    }
}
