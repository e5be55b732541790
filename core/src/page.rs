//! Pages: the on-disk layout of a datablock.
//!
//! Every block in a partition file is `page_size` bytes: a 28-byte header followed by
//! `page_size - 28` payload bytes. The header is stored big-endian:
//!
//! ```text
//! offset  field          type
//! 0       prev_block     i64   partition-relative block, -1 = none
//! 8       next_block     i64   partition-relative block, -1 = none
//! 16      bytes_used     i16   payload high-water mark
//! 18      bytes_in_use   i16   live payload bytes
//! 20      page_lsn       i64   id of the last before-image log record, 0 = none
//! ```
//!
//! Page links are partition-relative: a chain of pages never leaves its partition.
//! Both byte counters are stored as `i16`, which bounds the largest page at [`MAX_PAGE_SIZE`].

use alloc::vec::Vec;

/// Size of the page header in bytes.
pub const HEADER_SIZE: usize = 28;

/// The on-disk value of an absent page link.
pub const NO_LINK: i64 = -1;

/// The smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// The largest supported page size. Payload offsets must fit in an `i16`.
pub const MAX_PAGE_SIZE: usize = 32768;

/// Whether `page_size` is a supported page size: a power of two within
/// `MIN_PAGE_SIZE..=MAX_PAGE_SIZE`.
pub const fn is_valid_page_size(page_size: usize) -> bool {
    page_size.is_power_of_two() && page_size >= MIN_PAGE_SIZE && page_size <= MAX_PAGE_SIZE
}

/// The number of payload bytes a page of the given size holds.
pub const fn payload_capacity(page_size: usize) -> usize {
    page_size - HEADER_SIZE
}

/// The decoded page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// The previous page of the chain, if any.
    pub prev_block: Option<u64>,
    /// The next page of the chain, if any.
    pub next_block: Option<u64>,
    /// High-water mark of the payload. Bytes past this are unused.
    pub bytes_used: u16,
    /// Number of live payload bytes. Never exceeds `bytes_used`.
    pub bytes_in_use: u16,
    /// Record id of the last before-image logged for this page, if any.
    pub page_lsn: Option<u64>,
}

/// Error decoding a page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidPageHeader {
    /// The buffer is shorter than [`HEADER_SIZE`].
    Length,
    /// A byte counter is negative.
    NegativeCount,
    /// `bytes_in_use` exceeds `bytes_used`.
    InUseAboveUsed,
}

impl core::fmt::Display for InvalidPageHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            InvalidPageHeader::Length => f.write_str("page header truncated"),
            InvalidPageHeader::NegativeCount => f.write_str("negative byte count in page header"),
            InvalidPageHeader::InUseAboveUsed => f.write_str("bytes_in_use exceeds bytes_used"),
        }
    }
}

impl PageHeader {
    /// The header of a freshly initialized page: no links, nothing stored.
    pub const EMPTY: PageHeader = PageHeader {
        prev_block: None,
        next_block: None,
        bytes_used: 0,
        bytes_in_use: 0,
        page_lsn: None,
    };

    /// Whether the page stores nothing. Empty pages are considered free by the allocator scan.
    pub fn is_empty(&self) -> bool {
        self.bytes_used == 0 && self.bytes_in_use == 0
    }

    /// Encode the header into the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// Panics if `buf` is shorter than the header.
    pub fn encode_to(&self, buf: &mut [u8]) {
        let buf = &mut buf[..HEADER_SIZE];
        buf[0..8].copy_from_slice(&encode_link(self.prev_block).to_be_bytes());
        buf[8..16].copy_from_slice(&encode_link(self.next_block).to_be_bytes());
        buf[16..18].copy_from_slice(&(self.bytes_used as i16).to_be_bytes());
        buf[18..20].copy_from_slice(&(self.bytes_in_use as i16).to_be_bytes());
        buf[20..28].copy_from_slice(&(self.page_lsn.unwrap_or(0) as i64).to_be_bytes());
    }

    /// Decode a header from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, InvalidPageHeader> {
        if buf.len() < HEADER_SIZE {
            return Err(InvalidPageHeader::Length);
        }
        let i64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            i64::from_be_bytes(b)
        };
        let i16_at = |at: usize| i16::from_be_bytes([buf[at], buf[at + 1]]);

        let bytes_used = i16_at(16);
        let bytes_in_use = i16_at(18);
        if bytes_used < 0 || bytes_in_use < 0 {
            return Err(InvalidPageHeader::NegativeCount);
        }
        if bytes_in_use > bytes_used {
            return Err(InvalidPageHeader::InUseAboveUsed);
        }
        let lsn = i64_at(20);

        Ok(PageHeader {
            prev_block: decode_link(i64_at(0)),
            next_block: decode_link(i64_at(8)),
            bytes_used: bytes_used as u16,
            bytes_in_use: bytes_in_use as u16,
            page_lsn: if lsn <= 0 { None } else { Some(lsn as u64) },
        })
    }
}

fn encode_link(link: Option<u64>) -> i64 {
    match link {
        Some(block) => block as i64,
        None => NO_LINK,
    }
}

fn decode_link(raw: i64) -> Option<u64> {
    if raw < 0 {
        None
    } else {
        Some(raw as u64)
    }
}

/// Build the full on-disk image of an empty page.
pub fn empty_page(page_size: usize) -> Vec<u8> {
    let mut page = alloc::vec![0u8; page_size];
    PageHeader::EMPTY.encode_to(&mut page);
    page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_header_layout() {
        let mut buf = [0u8; HEADER_SIZE];
        PageHeader::EMPTY.encode_to(&mut buf);
        assert_eq!(&buf[0..8], &[0xFF; 8]);
        assert_eq!(&buf[8..16], &[0xFF; 8]);
        assert_eq!(&buf[16..28], &[0; 12]);
        assert_eq!(PageHeader::decode(&buf), Ok(PageHeader::EMPTY));
    }

    #[test]
    fn header_is_big_endian() {
        let header = PageHeader {
            prev_block: Some(1),
            next_block: Some(0x0102),
            bytes_used: 0x0304,
            bytes_in_use: 0x0300,
            page_lsn: Some(7),
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode_to(&mut buf);
        assert_eq!(buf[7], 1);
        assert_eq!(&buf[14..16], &[0x01, 0x02]);
        assert_eq!(&buf[16..18], &[0x03, 0x04]);
        assert_eq!(&buf[18..20], &[0x03, 0x00]);
        assert_eq!(buf[27], 7);
        assert_eq!(PageHeader::decode(&buf), Ok(header));
    }

    #[test]
    fn zeroed_buffer_decodes_as_linked_to_block_zero() {
        // Only `extend` writing initialized pages keeps this from ever being read.
        let header = PageHeader::decode(&[0u8; HEADER_SIZE]).unwrap();
        assert_eq!(header.prev_block, Some(0));
        assert!(header.is_empty());
        assert_eq!(header.page_lsn, None);
    }

    #[test]
    fn rejects_bad_counts() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[16..18].copy_from_slice(&(-1i16).to_be_bytes());
        assert_eq!(
            PageHeader::decode(&buf),
            Err(InvalidPageHeader::NegativeCount)
        );

        let mut buf = [0u8; HEADER_SIZE];
        buf[16..18].copy_from_slice(&5i16.to_be_bytes());
        buf[18..20].copy_from_slice(&6i16.to_be_bytes());
        assert_eq!(
            PageHeader::decode(&buf),
            Err(InvalidPageHeader::InUseAboveUsed)
        );

        assert_eq!(
            PageHeader::decode(&[0u8; 10]),
            Err(InvalidPageHeader::Length)
        );
    }

    #[test]
    fn page_sizes() {
        assert!(is_valid_page_size(512));
        assert!(is_valid_page_size(4096));
        assert!(is_valid_page_size(32768));
        assert!(!is_valid_page_size(256));
        assert!(!is_valid_page_size(65536));
        assert!(!is_valid_page_size(3000));
        assert_eq!(payload_capacity(4096), 4068);
        assert!(payload_capacity(MAX_PAGE_SIZE) <= i16::MAX as usize);
    }

    #[test]
    fn empty_page_image() {
        let page = empty_page(512);
        assert_eq!(page.len(), 512);
        assert_eq!(PageHeader::decode(&page), Ok(PageHeader::EMPTY));
        assert!(page[HEADER_SIZE..].iter().all(|b| *b == 0));
    }
}
