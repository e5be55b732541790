//! The error taxonomy of the storage engine.

use pagestore_core::VirtualBlockAddr;
use std::io;

/// An error returned by the storage engine.
///
/// Apart from a cache miss, no failure is absorbed inside the engine: every variant surfaces to
/// the caller of the operation that hit it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A physical read, write, extension or durability barrier failed.
    ///
    /// Fatal for the partition. The engine never retries.
    #[error("storage I/O failed on partition {partition}")]
    StorageIo {
        partition: u8,
        #[source]
        source: io::Error,
    },
    /// The page-access contract was violated, e.g. a release below zero pins, a write of a dirty
    /// page without a logged before-image, or use of a handle discarded by a rollback.
    #[error("latch violation on block {addr}: {reason}")]
    LatchViolation {
        addr: VirtualBlockAddr,
        reason: &'static str,
    },
    /// The partition file could not be extended to make room for new blocks.
    #[error("no space left to allocate in partition {partition}")]
    AllocationExhausted {
        partition: u8,
        #[source]
        source: io::Error,
    },
    /// The recovery log could not be appended to, read, or replayed.
    #[error("recovery log failure on partition {partition}: {detail}")]
    Recovery { partition: u8, detail: String },
    /// A byte range falls outside of a page payload.
    #[error("range {offset}..{offset}+{len} is outside of the payload of block {addr}")]
    OutOfBounds {
        addr: VirtualBlockAddr,
        offset: usize,
        len: usize,
    },
    /// Invalid options or a database created with incompatible options.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A specialized result type for storage engine operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn io(partition: u8) -> impl FnOnce(io::Error) -> StoreError {
        move |source| StoreError::StorageIo { partition, source }
    }

    pub(crate) fn recovery(partition: u8) -> impl FnOnce(anyhow::Error) -> StoreError {
        move |err| StoreError::Recovery {
            partition,
            detail: format!("{err:#}"),
        }
    }

    pub(crate) fn latch(addr: VirtualBlockAddr, reason: &'static str) -> StoreError {
        StoreError::LatchViolation { addr, reason }
    }

    /// Whether this error is a [`StoreError::LatchViolation`].
    pub fn is_latch_violation(&self) -> bool {
        matches!(self, StoreError::LatchViolation { .. })
    }
}
