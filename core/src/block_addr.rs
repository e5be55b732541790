//! Virtual block addresses.
//!
//! A [`VirtualBlockAddr`] names one fixed-size block across all partitions of a store. It packs a
//! partition id into the top 3 bits of a `u64` and a partition-relative block number into the
//! low 61 bits. Because the partition bits are disjoint from the block bits, two addresses with
//! different partitions never compare equal, no matter their block numbers.
//!
//! The block number is a block *index*: its byte offset in the partition file is
//! `block * page_size`.

use core::fmt;

/// Mask selecting the partition bits of a raw address.
pub const PARTITION_MASK: u64 = 0xE000_0000_0000_0000;

/// Mask selecting the block bits of a raw address.
pub const BLOCK_MASK: u64 = 0x1FFF_FFFF_FFFF_FFFF;

/// Number of bits the partition id is shifted by.
pub const PARTITION_SHIFT: u32 = 61;

/// The maximum number of partitions an address can name.
pub const MAX_PARTITIONS: usize = 8;

/// The largest representable block number.
pub const MAX_BLOCK: u64 = BLOCK_MASK;

/// The reserved root block: block 0 of partition 0. It is never handed out by an allocator.
pub const ROOT: VirtualBlockAddr = VirtualBlockAddr(0);

/// A partition-qualified block number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "borsh",
    derive(borsh::BorshSerialize, borsh::BorshDeserialize)
)]
pub struct VirtualBlockAddr(u64);

impl VirtualBlockAddr {
    /// Build an address. Inputs are masked into range: a partition above 7 or a block above
    /// [`MAX_BLOCK`] silently wraps. Use [`Self::try_new`] to reject such inputs instead.
    pub const fn new(partition: u8, block: u64) -> Self {
        let hi = ((partition as u64) << PARTITION_SHIFT) & PARTITION_MASK;
        VirtualBlockAddr(hi | (block & BLOCK_MASK))
    }

    /// Build an address, returning `None` if either component is out of range.
    pub const fn try_new(partition: u8, block: u64) -> Option<Self> {
        if partition as usize >= MAX_PARTITIONS || block > MAX_BLOCK {
            return None;
        }
        Some(Self::new(partition, block))
    }

    /// The partition id, in `0..8`.
    pub const fn partition(&self) -> u8 {
        ((self.0 & PARTITION_MASK) >> PARTITION_SHIFT) as u8
    }

    /// The partition-relative block number.
    pub const fn block(&self) -> u64 {
        self.0 & BLOCK_MASK
    }

    /// The packed representation.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Reinterpret a packed representation. Every `u64` is a valid address.
    pub const fn from_raw(raw: u64) -> Self {
        VirtualBlockAddr(raw)
    }

    /// Whether this is the reserved root block.
    pub const fn is_root(&self) -> bool {
        self.0 == ROOT.0
    }

    /// The address of another block in the same partition.
    pub const fn sibling(&self, block: u64) -> Self {
        Self::new(self.partition(), block)
    }
}

impl fmt::Debug for VirtualBlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualBlockAddr({}:{})", self.partition(), self.block())
    }
}

impl fmt::Display for VirtualBlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition(), self.block())
    }
}

impl From<VirtualBlockAddr> for u64 {
    fn from(addr: VirtualBlockAddr) -> u64 {
        addr.0
    }
}
