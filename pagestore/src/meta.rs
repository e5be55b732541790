//! The utility functions for handling the metadata file.
//!
//! The metadata file holds a single page. Rewriting and syncing it is the global commit point:
//! a transaction is durable exactly when a metadata page carrying its `commit_seqn` has been
//! synced.

use anyhow::{ensure, Result};
use std::fs::File;
use std::os::unix::fs::FileExt as _;

use crate::failpoint::{self, Failpoints};

/// Size of the metadata page on disk.
pub const META_SIZE: usize = 4096;

const MAGIC: &[u8; 8] = b"PGSTORE1";
const VERSION: u32 = 1;
const ENCODED_LEN: usize = 32;

/// This data structure describes the global state of the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    /// The size of every page in every partition.
    pub page_size: u32,
    /// The number of partitions.
    pub partitions: u32,
    /// The sequence number of the last commit.
    ///
    /// 0 means there were no commits. Log records of the running transaction are stamped with
    /// `commit_seqn + 1`.
    pub commit_seqn: u64,
}

impl Meta {
    pub fn new(page_size: u32, partitions: u32) -> Self {
        Self {
            page_size,
            partitions,
            commit_seqn: 0,
        }
    }

    /// The epoch of the transaction running on top of this state.
    pub fn epoch(&self) -> u64 {
        self.commit_seqn + 1
    }

    pub fn encode_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= ENCODED_LEN);
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&self.page_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.partitions.to_le_bytes());
        buf[20..24].copy_from_slice(&0u32.to_le_bytes());
        buf[24..32].copy_from_slice(&self.commit_seqn.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure!(buf.len() >= ENCODED_LEN, "metadata page truncated");
        ensure!(&buf[0..8] == MAGIC, "not a pagestore metadata file");
        // UNWRAP: slices of fixed, checked length.
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        ensure!(version == VERSION, "unsupported metadata version {version}");
        let page_size = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let partitions = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let commit_seqn = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        Ok(Self {
            page_size,
            partitions,
            commit_seqn,
        })
    }

    pub fn read(fd: &File) -> Result<Self> {
        let mut page = vec![0u8; META_SIZE];
        fd.read_exact_at(&mut page, 0)?;
        Meta::decode(&page)
    }

    pub fn write(fd: &File, meta: &Meta, failpoints: &Failpoints) -> Result<()> {
        failpoints.maybe_fail(failpoint::META_WRITE)?;
        let mut page = vec![0u8; META_SIZE];
        meta.encode_to(&mut page);
        fd.write_all_at(&page, 0)?;
        fd.sync_all()?;
        Ok(())
    }
}
