//! Named fault-injection points.
//!
//! Failpoints are scoped to one open store rather than to a thread or the process, so parallel
//! tests never observe each other's faults and the partition worker threads see the same set as
//! the thread that enabled them.

use parking_lot::Mutex;
use std::{collections::HashSet, io, sync::Arc};

/// Fails every append to a recovery log.
pub const LOG_APPEND: &str = "recovery-log-append";
/// Fails every page write issued through a partition I/O worker.
pub const PAGE_WRITE: &str = "page-write";
/// Fails the metadata write that makes a commit durable.
pub const META_WRITE: &str = "meta-write";

/// A shared set of enabled failpoints.
#[derive(Clone, Default)]
pub struct Failpoints {
    enabled: Arc<Mutex<HashSet<String>>>,
}

impl Failpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self, name: &str) {
        self.enabled.lock().insert(name.to_string());
    }

    pub fn disable(&self, name: &str) {
        self.enabled.lock().remove(name);
    }

    pub fn clear(&self) {
        self.enabled.lock().clear();
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.lock().contains(name)
    }

    /// Returns an error if the named failpoint is enabled.
    pub fn maybe_fail(&self, name: &str) -> io::Result<()> {
        if self.is_enabled(name) {
            Err(io::Error::other(format!("failpoint triggered: {name}")))
        } else {
            Ok(())
        }
    }
}
