//! Free block bookkeeping.
//!
//! Each partition keeps a set of free block numbers, owned by the partition's I/O worker thread so
//! that allocation never races with extension. Blocks are handed out lowest first.
//!
//! A block is free when its header reports nothing stored. The set is rebuilt by scanning
//! backward from the end of the partition file and stopping at the first block that stores
//! data, so only the empty tail of a file is ever reclaimed.

use std::{
    collections::{BTreeSet, HashSet},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use crate::options::PartitionPolicy;

/// The free blocks of one partition.
pub struct FreeBlocks {
    partition: u8,
    free: BTreeSet<u64>,
}

impl FreeBlocks {
    pub fn new(partition: u8) -> Self {
        Self {
            partition,
            free: BTreeSet::new(),
        }
    }

    fn is_reserved(&self, block: u64) -> bool {
        self.partition == 0 && block == 0
    }

    /// Rebuild the set from a backward scan.
    ///
    /// `len_blocks` is the current partition length. `is_empty(block)` reports whether a block
    /// stores nothing. Blocks in `exclude` are currently handed out and are skipped without ending
    /// the scan.
    pub fn rescan<E>(
        &mut self,
        len_blocks: u64,
        exclude: &HashSet<u64>,
        mut is_empty: impl FnMut(u64) -> Result<bool, E>,
    ) -> Result<(), E> {
        self.free.clear();
        for block in (0..len_blocks).rev() {
            if self.is_reserved(block) {
                break;
            }
            if exclude.contains(&block) {
                continue;
            }
            if !is_empty(block)? {
                break;
            }
            self.free.insert(block);
        }
        Ok(())
    }

    /// Add the blocks of a freshly extended region `old_len..new_len`.
    pub fn add_range(&mut self, old_len: u64, new_len: u64) {
        for block in old_len..new_len {
            if !self.is_reserved(block) {
                self.free.insert(block);
            }
        }
    }

    /// Remove `block` from the set once it stores data. Returns whether it was free.
    pub fn claim(&mut self, block: u64) -> bool {
        self.free.remove(&block)
    }

    /// Take the lowest free block.
    pub fn pop(&mut self) -> Option<u64> {
        self.free.pop_first()
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

/// Picks the partition of a new page when the caller gives no hint.
pub struct PartitionChooser {
    policy: PartitionPolicy,
    next: AtomicUsize,
    /// Published lengths, in blocks, of every partition file.
    high_water: Vec<Arc<AtomicU64>>,
}

impl PartitionChooser {
    pub fn new(policy: PartitionPolicy, high_water: Vec<Arc<AtomicU64>>) -> Self {
        assert!(!high_water.is_empty());
        Self {
            policy,
            next: AtomicUsize::new(0),
            high_water,
        }
    }

    pub fn choose(&self) -> u8 {
        let partitions = self.high_water.len();
        let chosen = match self.policy {
            PartitionPolicy::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % partitions,
            PartitionPolicy::SmallestFirst => self
                .high_water
                .iter()
                .enumerate()
                .min_by_key(|(_, len)| len.load(Ordering::Relaxed))
                .map_or(0, |(i, _)| i),
        };
        chosen as u8
    }
}
