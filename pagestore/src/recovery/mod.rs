//! The per-partition recovery log.
//!
//! Before a dirty page may reach its partition file, the page's current durable image is appended
//! to the partition's log as an Undoable record and fsynced. A commit discards the log. A rollback
//! walks the Undoable records from the newest to the oldest and writes every before-image back,
//! recording a Compensation for each so that an interrupted rollback is never undone twice.
//!
//! Every record carries the epoch of the transaction that wrote it, the commit sequence number it
//! will get once committed. On open, records of an epoch that the metadata file already reports as
//! committed are stale leftovers of a crash between the commit point and the log prune. Anything
//! newer belongs to a transaction that never committed and is rolled back.

use pagestore_core::GroupTag;
use std::{
    collections::{HashMap, HashSet},
    fs::File,
    path::Path,
    sync::Arc,
};

use crate::{
    error::{Result, StoreError},
    failpoint::{self, Failpoints},
    io::PartitionIo,
    metrics::{Metric, Metrics},
    seglog::{self, RecordId, SegmentedLog},
};

pub mod record;

pub use self::record::{LogInstance, LogRecord};

/// The state of a partition's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    /// Nothing is outstanding.
    Idle,
    /// Before-images were logged since the last commit, rollback or checkpoint.
    Logging,
    /// A checkpoint was taken and nothing was logged since.
    Flushed,
}

/// What recovery did to a partition at open.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records of already committed transactions that were dropped.
    pub discarded: usize,
    /// Compensations written again.
    pub redone: usize,
    /// Before-images restored.
    pub undone: usize,
}

/// The recovery log of one partition.
pub struct RecoveryLog {
    partition: u8,
    seglog: SegmentedLog,
    state: LogState,
    /// The first record of the outstanding undo chain.
    first_instance: Option<LogInstance>,
    /// Blocks whose pre-transaction image is already in the log.
    logged: HashMap<u64, RecordId>,
    failpoints: Failpoints,
    metrics: Metrics,
}

/// The file name prefix of the log segments of `partition`.
pub fn log_prefix(partition: u8) -> String {
    format!("undo.{partition}")
}

impl RecoveryLog {
    /// Open the log of `partition` under `dir`, returning it with every intact record found on
    /// disk. The records must be passed to [`Self::recover`] before the log is used.
    pub fn open(
        dir: &Path,
        dir_fd: Arc<File>,
        partition: u8,
        max_segment_size: u64,
        failpoints: Failpoints,
        metrics: Metrics,
    ) -> Result<(Self, Vec<(RecordId, LogRecord)>)> {
        let mut records = Vec::new();
        let seglog = seglog::open(
            dir.to_path_buf(),
            dir_fd,
            log_prefix(partition),
            max_segment_size,
            |id, payload| {
                records.push((id, LogRecord::decode(payload)?));
                Ok(())
            },
        )
        .map_err(StoreError::recovery(partition))?;

        let log = Self {
            partition,
            seglog,
            state: LogState::Idle,
            first_instance: None,
            logged: HashMap::new(),
            failpoints,
            metrics,
        };
        Ok((log, records))
    }

    pub fn partition(&self) -> u8 {
        self.partition
    }

    pub fn state(&self) -> LogState {
        self.state
    }

    /// The first record of the outstanding undo chain, if any.
    pub fn first_instance(&self) -> Option<LogInstance> {
        self.first_instance
    }

    /// Whether the running transaction already logged the before-image of `block`.
    pub fn is_logged(&self, block: u64) -> bool {
        self.logged.contains_key(&block)
    }

    fn append(&mut self, record: &LogRecord) -> Result<RecordId> {
        self.failpoints
            .maybe_fail(failpoint::LOG_APPEND)
            .map_err(|e| StoreError::recovery(self.partition)(e.into()))?;
        self.seglog
            .append(&record.encode())
            .map_err(StoreError::recovery(self.partition))
    }

    /// Durably log the before-image of `block` for the transaction of `epoch`.
    ///
    /// The before-image is the block's current durable image, read from the partition file. A
    /// block is logged once per transaction: later flushes overwrite the durable image, but the
    /// image to restore on rollback stays the one from before the transaction.
    pub fn write_log(&mut self, io: &PartitionIo, block: u64, epoch: u64) -> Result<RecordId> {
        if let Some(id) = self.logged.get(&block) {
            return Ok(*id);
        }

        let before_image = io.seek_read_full(block)?;
        let mut group = GroupTag::BEFORE_IMAGE;
        if self.first_instance.is_none() {
            group |= GroupTag::FIRST;
        }
        let record_id = self.append(&LogRecord::Undoable {
            group,
            epoch,
            block,
            before_image,
        })?;

        if self.first_instance.is_none() {
            self.first_instance = Some(LogInstance {
                partition: self.partition,
                record_id,
            });
        }
        self.logged.insert(block, record_id);
        self.state = LogState::Logging;
        self.metrics.count(Metric::BeforeImagesLogged);
        Ok(record_id)
    }

    fn reset(&mut self) -> Result<()> {
        self.seglog
            .prune_all()
            .map_err(StoreError::recovery(self.partition))?;
        self.logged.clear();
        self.first_instance = None;
        self.state = LogState::Idle;
        Ok(())
    }

    /// Close the undo chain with a commit marker and discard it. Called once the commit point of
    /// `epoch` is durable.
    pub fn commit(&mut self, epoch: u64) -> Result<()> {
        if !self.seglog.is_empty() {
            self.append(&LogRecord::Loggable {
                group: GroupTag::COMMIT | GroupTag::LAST,
                epoch,
            })?;
        }
        self.reset()
    }

    /// Record a checkpoint marker: every dirty page of the partition has been flushed.
    ///
    /// A no-op when nothing is outstanding.
    pub fn checkpoint(&mut self, epoch: u64) -> Result<()> {
        if self.seglog.is_empty() {
            return Ok(());
        }
        self.append(&LogRecord::Loggable {
            group: GroupTag::CHECKPOINT,
            epoch,
        })?;
        self.state = LogState::Flushed;
        Ok(())
    }

    /// Restore every logged before-image, newest first, close the undo chain with an abort marker
    /// and discard it.
    ///
    /// Returns the number of restored pages. Calling it with nothing outstanding does nothing.
    pub fn rollback(&mut self, io: &PartitionIo) -> Result<usize> {
        if self.seglog.is_empty() {
            self.reset()?;
            return Ok(0);
        }

        let mut records = Vec::new();
        self.seglog
            .for_each_record(|id, payload| {
                records.push((id, LogRecord::decode(payload)?));
                Ok(())
            })
            .map_err(StoreError::recovery(self.partition))?;

        let compensated = compensated_ids(&records);
        let mut undone = 0;
        for (id, record) in records.iter().rev() {
            if matches!(record, LogRecord::Undoable { .. }) && !compensated.contains(id) {
                self.undo(io, *id, record)?;
                undone += 1;
            }
        }
        io.force()?;
        if let Some((_, last)) = records.last() {
            self.append(&LogRecord::Loggable {
                group: GroupTag::ABORT | GroupTag::LAST,
                epoch: last.epoch(),
            })?;
        }
        self.reset()?;
        Ok(undone)
    }

    fn undo(&mut self, io: &PartitionIo, id: RecordId, record: &LogRecord) -> Result<()> {
        let instance = LogInstance {
            partition: self.partition,
            record_id: id,
        };
        let Some(compensation) = record.compensation(instance) else {
            return Ok(());
        };
        self.append(&compensation)?;
        if let LogRecord::Compensation { block, image, .. } = compensation {
            io.seek_write_full(block, image)?;
        }
        Ok(())
    }

    /// Bring the partition back to its last committed state after an unclean shutdown.
    ///
    /// `records` are the records returned by [`Self::open`] and `committed_seqn` is the commit
    /// sequence number of the metadata file. Any failure is reported as
    /// [`StoreError::Recovery`].
    pub fn recover(
        &mut self,
        io: &PartitionIo,
        records: Vec<(RecordId, LogRecord)>,
        committed_seqn: u64,
    ) -> Result<RecoveryReport> {
        let partition = self.partition;
        self.recover_inner(io, records, committed_seqn)
            .map_err(|err| match err {
                err @ StoreError::Recovery { .. } => err,
                other => StoreError::Recovery {
                    partition,
                    detail: format!("{:#}", anyhow::Error::new(other)),
                },
            })
    }

    fn recover_inner(
        &mut self,
        io: &PartitionIo,
        records: Vec<(RecordId, LogRecord)>,
        committed_seqn: u64,
    ) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        if records.is_empty() {
            self.reset()?;
            return Ok(report);
        }

        // A chain closed by a commit or abort marker needs nothing more; only its prune was lost.
        let total = records.len();
        let closed = records
            .iter()
            .rposition(|(_, r)| r.group().intersects(GroupTag::COMMIT | GroupTag::ABORT))
            .map_or(0, |i| i + 1);
        let live: Vec<(RecordId, LogRecord)> = records
            .into_iter()
            .skip(closed)
            .filter(|(_, record)| record.epoch() > committed_seqn)
            .collect();
        report.discarded = total - live.len();

        let redo_from = live
            .iter()
            .rposition(|(_, r)| r.group().contains(GroupTag::CHECKPOINT))
            .map_or(0, |i| i + 1);
        for (_, record) in &live[redo_from..] {
            if let LogRecord::Compensation { block, image, .. } = record {
                io.seek_write_full(*block, image.clone())?;
                report.redone += 1;
            }
        }

        let compensated = compensated_ids(&live);
        for (id, record) in live.iter().rev() {
            if matches!(record, LogRecord::Undoable { .. }) && !compensated.contains(id) {
                self.undo(io, *id, record)?;
                report.undone += 1;
            }
        }

        io.force()?;
        self.reset()?;
        if report != RecoveryReport::default() {
            tracing::info!(
                partition = self.partition,
                discarded = report.discarded,
                redone = report.redone,
                undone = report.undone,
                "recovered partition"
            );
        }
        Ok(report)
    }
}

fn compensated_ids(records: &[(RecordId, LogRecord)]) -> HashSet<RecordId> {
    records
        .iter()
        .filter_map(|(_, record)| match record {
            LogRecord::Compensation { compensates, .. } => Some(compensates.record_id),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BackingMode;
    use pagestore_core::page::{PageHeader, HEADER_SIZE};

    const PAGE: usize = 512;

    struct Fixture {
        dir: tempfile::TempDir,
        failpoints: Failpoints,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                failpoints: Failpoints::new(),
            }
        }

        fn io(&self) -> PartitionIo {
            PartitionIo::open(
                self.dir.path(),
                1,
                BackingMode::PlainFile,
                PAGE,
                4,
                self.failpoints.clone(),
            )
            .unwrap()
        }

        fn log(&self) -> (RecoveryLog, Vec<(RecordId, LogRecord)>) {
            let dir_fd = Arc::new(File::open(self.dir.path()).unwrap());
            RecoveryLog::open(
                self.dir.path(),
                dir_fd,
                1,
                1 << 20,
                self.failpoints.clone(),
                Metrics::new(false),
            )
            .unwrap()
        }
    }

    fn page_with(byte: u8, len: usize) -> Vec<u8> {
        let mut page = vec![0u8; PAGE];
        PageHeader {
            bytes_used: len as u16,
            bytes_in_use: len as u16,
            ..PageHeader::EMPTY
        }
        .encode_to(&mut page);
        page[HEADER_SIZE..HEADER_SIZE + len].fill(byte);
        page
    }

    #[test]
    fn write_log_moves_to_logging_once_per_block() {
        let f = Fixture::new();
        let io = f.io();
        let (mut log, records) = f.log();
        assert!(records.is_empty());
        assert_eq!(log.state(), LogState::Idle);

        let first = log.write_log(&io, 0, 1).unwrap();
        assert_eq!(log.state(), LogState::Logging);
        assert_eq!(log.write_log(&io, 0, 1).unwrap(), first);
        let second = log.write_log(&io, 1, 1).unwrap();
        assert_ne!(first, second);
        assert_eq!(log.first_instance().unwrap().record_id, first);
        assert!(log.is_logged(1));

        log.checkpoint(1).unwrap();
        assert_eq!(log.state(), LogState::Flushed);
        log.commit(1).unwrap();
        assert_eq!(log.state(), LogState::Idle);
        assert!(!log.is_logged(0));
        assert!(log.first_instance().is_none());
    }

    #[test]
    fn rollback_restores_before_image() {
        let f = Fixture::new();
        let io = f.io();
        io.seek_write_full(2, page_with(0xAA, 10)).unwrap();
        let (mut log, _) = f.log();

        log.write_log(&io, 2, 1).unwrap();
        io.seek_write_full(2, page_with(0xBB, 20)).unwrap();

        assert_eq!(log.rollback(&io).unwrap(), 1);
        assert_eq!(io.seek_read_full(2).unwrap(), page_with(0xAA, 10));
        assert_eq!(log.state(), LogState::Idle);

        // Nothing outstanding: a second rollback is a no-op.
        assert_eq!(log.rollback(&io).unwrap(), 0);
        assert_eq!(io.seek_read_full(2).unwrap(), page_with(0xAA, 10));
    }

    #[test]
    fn append_failpoint_is_a_recovery_error() {
        let f = Fixture::new();
        let io = f.io();
        let (mut log, _) = f.log();
        f.failpoints.enable(failpoint::LOG_APPEND);
        let err = log.write_log(&io, 0, 1).unwrap_err();
        assert!(matches!(err, StoreError::Recovery { partition: 1, .. }));
        assert!(!log.is_logged(0));
        assert_eq!(log.state(), LogState::Idle);
    }

    #[test]
    fn recover_undoes_uncommitted_epoch() {
        let f = Fixture::new();
        let io = f.io();
        io.seek_write_full(0, page_with(1, 5)).unwrap();
        io.seek_write_full(1, page_with(2, 5)).unwrap();
        {
            let (mut log, _) = f.log();
            log.write_log(&io, 0, 4).unwrap();
            log.write_log(&io, 1, 4).unwrap();
            io.seek_write_full(0, page_with(9, 50)).unwrap();
            io.seek_write_full(1, page_with(9, 50)).unwrap();
            log.checkpoint(4).unwrap();
            // Dropped without commit or rollback.
        }

        let (mut log, records) = f.log();
        assert_eq!(records.len(), 3);
        let report = log.recover(&io, records, 3).unwrap();
        assert_eq!(report.undone, 2);
        assert_eq!(io.seek_read_full(0).unwrap(), page_with(1, 5));
        assert_eq!(io.seek_read_full(1).unwrap(), page_with(2, 5));

        let (_, records) = f.log();
        assert!(records.is_empty());
    }

    #[test]
    fn recover_discards_committed_epoch() {
        let f = Fixture::new();
        let io = f.io();
        {
            let (mut log, _) = f.log();
            log.write_log(&io, 0, 4).unwrap();
            io.seek_write_full(0, page_with(7, 7)).unwrap();
        }
        let (mut log, records) = f.log();
        // The metadata file already reports epoch 4 as committed.
        let report = log.recover(&io, records, 4).unwrap();
        assert_eq!(report.discarded, 1);
        assert_eq!(report.undone, 0);
        assert_eq!(io.seek_read_full(0).unwrap(), page_with(7, 7));
    }

    #[test]
    fn recover_finishes_an_interrupted_rollback() {
        let f = Fixture::new();
        let io = f.io();
        io.seek_write_full(0, page_with(1, 1)).unwrap();
        io.seek_write_full(1, page_with(2, 2)).unwrap();
        {
            let (mut log, _) = f.log();
            let first = log.write_log(&io, 0, 2).unwrap();
            log.write_log(&io, 1, 2).unwrap();
            io.seek_write_full(0, page_with(8, 8)).unwrap();
            io.seek_write_full(1, page_with(8, 8)).unwrap();
            // The rollback compensated the record of block 0, then crashed before writing it.
            let undo = LogRecord::Undoable {
                group: GroupTag::BEFORE_IMAGE,
                epoch: 2,
                block: 0,
                before_image: page_with(1, 1),
            };
            let comp = undo
                .compensation(LogInstance {
                    partition: 1,
                    record_id: first,
                })
                .unwrap();
            log.append(&comp).unwrap();
        }

        let (mut log, records) = f.log();
        let report = log.recover(&io, records, 1).unwrap();
        assert_eq!(report.redone, 1);
        assert_eq!(report.undone, 1);
        assert_eq!(io.seek_read_full(0).unwrap(), page_with(1, 1));
        assert_eq!(io.seek_read_full(1).unwrap(), page_with(2, 2));
    }

    #[test]
    fn commit_closes_the_chain_before_pruning() {
        let f = Fixture::new();
        let io = f.io();
        let (mut log, _) = f.log();
        log.write_log(&io, 0, 1).unwrap();

        f.failpoints.enable(failpoint::LOG_APPEND);
        assert!(log.commit(1).is_err());
        assert_eq!(log.state(), LogState::Logging);

        f.failpoints.disable(failpoint::LOG_APPEND);
        log.commit(1).unwrap();
        assert_eq!(log.state(), LogState::Idle);
        let (_, records) = f.log();
        assert!(records.is_empty());
    }

    #[test]
    fn recover_skips_a_chain_closed_by_an_abort() {
        let f = Fixture::new();
        let io = f.io();
        io.seek_write_full(0, page_with(1, 5)).unwrap();
        {
            let (mut log, _) = f.log();
            let id = log.write_log(&io, 0, 3).unwrap();
            io.seek_write_full(0, page_with(9, 9)).unwrap();
            // A rollback that finished but lost its prune.
            let undo = LogRecord::Undoable {
                group: GroupTag::BEFORE_IMAGE,
                epoch: 3,
                block: 0,
                before_image: page_with(1, 5),
            };
            let comp = undo
                .compensation(LogInstance {
                    partition: 1,
                    record_id: id,
                })
                .unwrap();
            log.append(&comp).unwrap();
            io.seek_write_full(0, page_with(1, 5)).unwrap();
            log.append(&LogRecord::Loggable {
                group: GroupTag::ABORT | GroupTag::LAST,
                epoch: 3,
            })
            .unwrap();
        }

        let (mut log, records) = f.log();
        assert_eq!(records.len(), 3);
        let report = log.recover(&io, records, 2).unwrap();
        assert_eq!(report.discarded, 3);
        assert_eq!(report.redone, 0);
        assert_eq!(report.undone, 0);
        assert_eq!(io.seek_read_full(0).unwrap(), page_with(1, 5));
    }

    #[test]
    fn failed_replay_is_a_recovery_error() {
        let f = Fixture::new();
        let io = f.io();
        {
            let (mut log, _) = f.log();
            log.write_log(&io, 0, 1).unwrap();
        }
        let (mut log, records) = f.log();
        f.failpoints.enable(failpoint::PAGE_WRITE);
        let err = log.recover(&io, records, 0).unwrap_err();
        assert!(matches!(err, StoreError::Recovery { partition: 1, .. }));
    }
}
