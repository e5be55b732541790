//! Cursor operations: byte streams spread over a chain of pages.
//!
//! A chain is a doubly linked list of pages of one partition, linked through the `prev_block` and
//! `next_block` header fields. The cursor operations start at the cursor of the given handle and
//! move the handle along the chain as pages fill up or run out, releasing each page they leave.

use crate::{buffer_pool::PageHandle, error::Result};

use super::tablespace::Tablespace;

impl Tablespace {
    /// Release `handle` and replace it with `next`. If the release fails, `next` is released as
    /// well and `handle` is left pointing at the page it was on, still pinned.
    fn step(&self, handle: &mut PageHandle, next: PageHandle) -> Result<()> {
        if let Err(err) = self.release(handle) {
            // A failed release keeps its pin, so a dirty new page is never left unpinned.
            let _ = self.release(&next);
            return Err(err);
        }
        *handle = next;
        Ok(())
    }

    /// Append a freshly allocated page to the chain after `handle`.
    fn link_new_page(&self, handle: &PageHandle) -> Result<PageHandle> {
        let new = self.acquire_new()?;
        {
            let mut state = handle.pinned_state()?;
            state.page.header_mut().next_block = Some(new.addr().block());
            state.mark_dirty();
        }
        let mut state = new.state();
        state.page.header_mut().prev_block = Some(handle.addr().block());
        state.mark_dirty();
        drop(state);
        Ok(new)
    }

    fn next_addr(&self, handle: &PageHandle) -> Result<Option<u64>> {
        Ok(handle.pinned_state()?.page.header().next_block)
    }

    /// Write `data` at the cursor, continuing on the next page of the chain when the current one
    /// is full. A missing next page is allocated in the same partition and linked in.
    ///
    /// On return `handle` is the page holding the last written byte, with the cursor right after
    /// it.
    pub fn write_bytes(&self, handle: &mut PageHandle, data: &[u8]) -> Result<()> {
        let mut written = 0;
        loop {
            {
                let mut state = handle.pinned_state()?;
                let room = state.page.capacity() - state.cursor;
                let n = room.min(data.len() - written);
                if n > 0 {
                    let cursor = state.cursor;
                    state.page.write_at(cursor, &data[written..written + n]);
                    state.cursor += n;
                    state.mark_dirty();
                    written += n;
                }
                if written == data.len() {
                    return Ok(());
                }
            }

            let next = match self.next_addr(handle)? {
                Some(block) => self.acquire(handle.addr().sibling(block))?,
                None => self.link_new_page(handle)?,
            };
            self.step(handle, next)?;
        }
    }

    /// Read up to `buf.len()` used bytes from the cursor on, following the chain. Returns the
    /// number of bytes read, which is short only when the chain ends.
    pub fn read_bytes(&self, handle: &mut PageHandle, buf: &mut [u8]) -> Result<usize> {
        let mut read = 0;
        loop {
            {
                let mut state = handle.pinned_state()?;
                let used = state.page.header().bytes_used as usize;
                let n = used.saturating_sub(state.cursor).min(buf.len() - read);
                if n > 0 {
                    let cursor = state.cursor;
                    state.page.read_at(cursor, &mut buf[read..read + n]);
                    state.cursor += n;
                    read += n;
                }
                state.touch();
                if read == buf.len() {
                    return Ok(read);
                }
            }

            match self.next_addr(handle)? {
                Some(block) => {
                    let next = self.acquire(handle.addr().sibling(block))?;
                    self.step(handle, next)?;
                }
                None => return Ok(read),
            }
        }
    }

    /// Delete up to `len` used bytes from the cursor on, following the chain. The cursor moves
    /// past the deleted span. Returns the number of bytes deleted.
    pub fn delete_bytes(&self, handle: &mut PageHandle, len: usize) -> Result<usize> {
        let mut deleted = 0;
        loop {
            {
                let mut state = handle.pinned_state()?;
                let used = state.page.header().bytes_used as usize;
                let n = used.saturating_sub(state.cursor).min(len - deleted);
                if n > 0 {
                    let cursor = state.cursor;
                    state.page.delete_at(cursor, n);
                    state.cursor += n;
                    state.mark_dirty();
                    deleted += n;
                }
                if deleted == len {
                    return Ok(deleted);
                }
            }

            match self.next_addr(handle)? {
                Some(block) => {
                    let next = self.acquire(handle.addr().sibling(block))?;
                    self.step(handle, next)?;
                }
                None => return Ok(deleted),
            }
        }
    }

    /// Release `handle` and pin the next page of its chain, if any.
    ///
    /// If the release fails the page keeps its pin until a rollback or a force-clear.
    pub fn next(&self, handle: PageHandle) -> Result<Option<PageHandle>> {
        let next = match self.next_addr(&handle)? {
            Some(block) => Some(self.acquire(handle.addr().sibling(block))?),
            None => None,
        };
        if let Err(err) = self.release(&handle) {
            if let Some(next) = next {
                let _ = self.release(&next);
            }
            return Err(err);
        }
        Ok(next)
    }
}
