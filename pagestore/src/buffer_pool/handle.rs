//! Page handles: one cached datablock shared between the buffer pool and its borrowers.

use parking_lot::{Mutex, MutexGuard};
use pagestore_core::{
    page::{self, InvalidPageHeader, PageHeader, HEADER_SIZE},
    VirtualBlockAddr,
};
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Instant,
};

use crate::error::{Result, StoreError};

/// The in-memory image of one page: its decoded header and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datablock {
    header: PageHeader,
    payload: Vec<u8>,
}

impl Datablock {
    /// An empty page of the given size.
    pub fn empty(page_size: usize) -> Self {
        Self {
            header: PageHeader::EMPTY,
            payload: vec![0; page::payload_capacity(page_size)],
        }
    }

    /// Decode a full on-disk page image.
    pub fn from_page(page: &[u8]) -> std::result::Result<Self, InvalidPageHeader> {
        let header = PageHeader::decode(page)?;
        Ok(Self {
            header,
            payload: page[HEADER_SIZE..].to_vec(),
        })
    }

    /// Encode the full on-disk page image.
    pub fn to_page(&self) -> Vec<u8> {
        let mut page = vec![0u8; HEADER_SIZE + self.payload.len()];
        self.header.encode_to(&mut page);
        page[HEADER_SIZE..].copy_from_slice(&self.payload);
        page
    }

    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut PageHeader {
        &mut self.header
    }

    /// The number of payload bytes the page holds.
    pub fn capacity(&self) -> usize {
        self.payload.len()
    }

    fn in_range(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .map_or(false, |end| end <= self.capacity())
    }

    /// Copy `data` into the payload at `offset`.
    ///
    /// Raises the high-water mark to the end of the write. The live byte count grows by the
    /// written length, capped at the high-water mark. Pages do not track which bytes are live, so
    /// overwriting live bytes below the high-water mark of a page with deleted gaps counts them
    /// again: the live count is an upper bound, exact only for pages without gaps.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> bool {
        if !self.in_range(offset, data.len()) {
            return false;
        }
        self.payload[offset..offset + data.len()].copy_from_slice(data);
        let end = (offset + data.len()) as u16;
        self.header.bytes_used = self.header.bytes_used.max(end);
        self.header.bytes_in_use = self
            .header
            .bytes_in_use
            .saturating_add(data.len() as u16)
            .min(self.header.bytes_used);
        true
    }

    /// Copy payload bytes starting at `offset` into `buf`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> bool {
        if !self.in_range(offset, buf.len()) {
            return false;
        }
        buf.copy_from_slice(&self.payload[offset..offset + buf.len()]);
        true
    }

    /// Zero `len` payload bytes at `offset`.
    ///
    /// The live byte count shrinks by `len`. The high-water mark only drops, to `offset`, when the
    /// deleted span ends exactly at it.
    pub fn delete_at(&mut self, offset: usize, len: usize) -> bool {
        if !self.in_range(offset, len) {
            return false;
        }
        self.payload[offset..offset + len].fill(0);
        if offset + len == self.header.bytes_used as usize {
            self.header.bytes_used = offset as u16;
        }
        self.header.bytes_in_use = self
            .header
            .bytes_in_use
            .saturating_sub(len as u16)
            .min(self.header.bytes_used);
        true
    }
}

/// The mutable state of a cached page.
#[derive(Debug)]
pub(crate) struct PageState {
    pub page: Datablock,
    /// Payload offset used by the cursor operations.
    pub cursor: usize,
    /// Dirty: the cached image differs from the durable one.
    pub in_core: bool,
    /// The before-image of the current dirty state is durable in the recovery log.
    pub in_log: bool,
    pub last_access: Instant,
    /// Dropped from the buffer pool by a rollback, a force-clear or an eviction.
    pub discarded: bool,
}

impl PageState {
    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub fn mark_dirty(&mut self) {
        self.in_core = true;
        self.in_log = false;
        self.touch();
    }
}

struct HandleInner {
    addr: VirtualBlockAddr,
    pins: AtomicU32,
    state: Mutex<PageState>,
}

/// A pinned reference to a cached page.
///
/// Cloning a handle does not pin the page again: pins are taken by acquiring and dropped by
/// releasing through the store.
#[derive(Clone)]
pub struct PageHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("addr", &self.inner.addr)
            .field("pins", &self.pins())
            .finish()
    }
}

impl PageHandle {
    pub(crate) fn new(addr: VirtualBlockAddr, page: Datablock, dirty: bool) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                addr,
                pins: AtomicU32::new(1),
                state: Mutex::new(PageState {
                    page,
                    cursor: 0,
                    in_core: dirty,
                    in_log: false,
                    last_access: Instant::now(),
                    discarded: false,
                }),
            }),
        }
    }

    pub fn addr(&self) -> VirtualBlockAddr {
        self.inner.addr
    }

    /// The current pin count.
    pub fn pins(&self) -> u32 {
        self.inner.pins.load(Ordering::Acquire)
    }

    /// A copy of the page header.
    pub fn header(&self) -> PageHeader {
        *self.inner.state.lock().page.header()
    }

    /// Whether the page has changes not yet written to its partition file.
    pub fn is_dirty(&self) -> bool {
        self.inner.state.lock().in_core
    }

    /// Whether the before-image of the current dirty state is durably logged.
    pub fn is_logged(&self) -> bool {
        self.inner.state.lock().in_log
    }

    /// The cursor position, a payload offset.
    pub fn cursor(&self) -> usize {
        self.inner.state.lock().cursor
    }

    /// Move the cursor to a payload offset.
    pub fn seek(&self, pos: usize) -> Result<()> {
        let mut state = self.inner.state.lock();
        if pos > state.page.capacity() {
            return Err(StoreError::OutOfBounds {
                addr: self.addr(),
                offset: pos,
                len: 0,
            });
        }
        state.cursor = pos;
        Ok(())
    }

    /// The number of payload bytes of the page.
    pub fn capacity(&self) -> usize {
        self.inner.state.lock().page.capacity()
    }

    /// Whether both handles refer to the same cached page.
    pub fn same_page(&self, other: &PageHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn pin(&self) {
        self.inner.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one pin. Fails, leaving the count untouched, if the page is not pinned.
    pub(crate) fn unpin(&self) -> Result<u32> {
        self.inner
            .pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1))
            .map(|prev| prev - 1)
            .map_err(|_| StoreError::latch(self.addr(), "release of an unpinned page"))
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, PageState> {
        self.inner.state.lock()
    }

    pub(crate) fn try_state(&self) -> Option<MutexGuard<'_, PageState>> {
        self.inner.state.try_lock()
    }

    /// Lock the page state of a handle that is live and pinned.
    pub(crate) fn pinned_state(&self) -> Result<MutexGuard<'_, PageState>> {
        let state = self.inner.state.lock();
        if state.discarded {
            return Err(StoreError::latch(
                self.addr(),
                "handle was dropped from the buffer pool",
            ));
        }
        if self.pins() == 0 {
            return Err(StoreError::latch(self.addr(), "page is not pinned"));
        }
        Ok(state)
    }

    /// Mark the handle as dropped from the buffer pool and clear its pins.
    pub(crate) fn discard(&self) {
        self.inner.state.lock().discarded = true;
        self.inner.pins.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_raises_high_water_and_caps_in_use() {
        let mut block = Datablock::empty(512);
        assert!(block.write_at(0, &[1; 100]));
        assert_eq!(block.header().bytes_used, 100);
        assert_eq!(block.header().bytes_in_use, 100);

        // Overwriting live bytes cannot push the live count past the high-water mark.
        assert!(block.write_at(50, &[2; 50]));
        assert_eq!(block.header().bytes_used, 100);
        assert_eq!(block.header().bytes_in_use, 100);

        assert!(block.write_at(200, &[3; 10]));
        assert_eq!(block.header().bytes_used, 210);
        assert_eq!(block.header().bytes_in_use, 110);
    }

    #[test]
    fn delete_only_lowers_high_water_at_the_end() {
        let mut block = Datablock::empty(512);
        block.write_at(0, &[1; 100]);

        assert!(block.delete_at(10, 20));
        assert_eq!(block.header().bytes_used, 100);
        assert_eq!(block.header().bytes_in_use, 80);

        assert!(block.delete_at(60, 40));
        assert_eq!(block.header().bytes_used, 60);
        assert_eq!(block.header().bytes_in_use, 40);

        let mut buf = [9u8; 20];
        assert!(block.read_at(10, &mut buf));
        assert_eq!(buf, [0u8; 20]);
    }

    #[test]
    fn overwrite_in_a_gapped_page_overcounts_up_to_the_high_water_mark() {
        let mut block = Datablock::empty(512);
        block.write_at(0, &[1; 100]);
        block.delete_at(0, 10);
        assert_eq!(block.header().bytes_in_use, 90);

        // Bytes 50..70 were live already but are counted again.
        assert!(block.write_at(50, &[2; 20]));
        assert_eq!(block.header().bytes_in_use, 100);
        assert!(block.write_at(50, &[2; 20]));
        assert_eq!(block.header().bytes_in_use, 100);
    }

    #[test]
    fn delete_saturates() {
        let mut block = Datablock::empty(512);
        block.write_at(0, &[1; 10]);
        assert!(block.delete_at(100, 50));
        assert_eq!(block.header().bytes_in_use, 0);
        assert_eq!(block.header().bytes_used, 10);
    }

    #[test]
    fn ranges_are_checked() {
        let mut block = Datablock::empty(512);
        let cap = block.capacity();
        assert_eq!(cap, 512 - HEADER_SIZE);
        assert!(block.write_at(cap - 4, &[1; 4]));
        assert!(!block.write_at(cap - 3, &[1; 4]));
        assert!(!block.read_at(usize::MAX, &mut [0; 2]));
        assert!(!block.delete_at(cap, 1));
    }

    #[test]
    fn page_image_round_trip() {
        let mut block = Datablock::empty(512);
        block.write_at(3, b"abc");
        block.header_mut().next_block = Some(9);
        let page = block.to_page();
        assert_eq!(page.len(), 512);
        assert_eq!(Datablock::from_page(&page).unwrap(), block);
    }

    #[test]
    fn pins_cannot_go_negative() {
        let handle = PageHandle::new(VirtualBlockAddr::new(1, 2), Datablock::empty(512), false);
        assert_eq!(handle.pins(), 1);
        handle.pin();
        assert_eq!(handle.unpin().unwrap(), 1);
        assert_eq!(handle.unpin().unwrap(), 0);
        assert!(handle.unpin().unwrap_err().is_latch_violation());
        assert_eq!(handle.pins(), 0);
        assert!(handle.pinned_state().is_err());
    }

    #[test]
    fn discarded_handles_are_rejected() {
        let handle = PageHandle::new(VirtualBlockAddr::new(0, 5), Datablock::empty(512), true);
        let clone = handle.clone();
        handle.discard();
        assert_eq!(clone.pins(), 0);
        assert!(clone.same_page(&handle));
        assert!(clone.pinned_state().unwrap_err().is_latch_violation());
    }
}
