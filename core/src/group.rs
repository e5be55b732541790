//! Group flags attached to recovery log records.

bitflags::bitflags! {
    /// Classifies a recovery log record within its transaction group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GroupTag: u8 {
        /// First record of a transaction group.
        const FIRST = 0b0000_0001;
        /// Last record of a transaction group.
        const LAST = 0b0000_0010;
        /// A compensation record. Never undone.
        const COMPENSATION = 0b0000_0100;
        /// Commit marker.
        const COMMIT = 0b0000_1000;
        /// Abort marker.
        const ABORT = 0b0001_0000;
        /// Checkpoint marker.
        const CHECKPOINT = 0b0010_0000;
        /// Record carries a page before-image.
        const BEFORE_IMAGE = 0b0100_0000;
    }
}

impl GroupTag {
    /// Whether the record is a marker carrying no page image.
    pub fn is_marker(&self) -> bool {
        self.intersects(GroupTag::COMMIT | GroupTag::ABORT | GroupTag::CHECKPOINT)
    }
}
