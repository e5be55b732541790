//! A segmented log: an append-only sequence of checksummed records spread over numbered segment
//! files.
//!
//! The log is not suitable for random access. Records are read by scanning from the oldest
//! segment to the newest, which happens when the log is opened and when its records are replayed.
//!
//! Every record is fsynced before [`SegmentedLog::append`] returns. A record that did not fully
//! reach the disk is detected on open by its length or checksum and the log is truncated right
//! before it, together with anything that follows.
//!
//! The log is pruned as a whole: [`SegmentedLog::prune_all`] deletes every segment. Segment ids
//! keep increasing across prunes, so the files of one generation never get reused by the next.
//!
//! `max_segment_size` is a soft limit: the record that crosses it still lands in the current
//! segment and the next append opens a new one.

use anyhow::{bail, Result};
use std::{
    fmt,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::Arc,
};

mod segment_filename;
mod segment_rw;

use self::segment_rw::{ReadRecord, SegmentFileReader, SegmentFileWriter};

const RECORD_ALIGNMENT: u32 = 512;
const HEADER_SIZE: u32 = 16; // payload length u32, record ID u64, crc32 u32
const MAX_RECORD_PAYLOAD_SIZE: u32 = 1 << 30; // 1 GiB

/// A record ID. Record IDs start at 1 and increase by one per appended record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub u64);

impl RecordId {
    pub fn nil() -> Self {
        RecordId(0)
    }

    pub fn next(&self) -> Self {
        RecordId(self.0 + 1)
    }

    pub fn is_nil(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        RecordId(id)
    }
}

struct RecordHeader {
    payload_length: u32,
    record_id: RecordId,
    checksum: u32,
}

impl RecordHeader {
    fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[4..12].copy_from_slice(&self.record_id.0.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE as usize]) -> Self {
        // UNWRAP: fixed-size subslices of a fixed-size array.
        Self {
            payload_length: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            record_id: RecordId(u64::from_le_bytes(buf[4..12].try_into().unwrap())),
            checksum: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }
}

#[derive(Debug)]
struct Segment {
    id: u32,
    path: PathBuf,
}

pub struct SegmentedLog {
    root_dir_path: PathBuf,
    /// The directory holding the segment files, synced whenever a segment is created or removed.
    root_dir_fd: Arc<File>,
    filename_prefix: String,
    /// Soft limit on the size of a segment file.
    max_segment_size: u64,
    /// The first record still in the log. Nil if the log is empty.
    start_live: RecordId,
    /// The last record ever appended, including pruned ones. Nil if nothing was appended since
    /// the log was opened empty.
    end_live: RecordId,
    /// Live segments, oldest first. The last one is the head segment.
    segments: Vec<Segment>,
    /// The highest segment id handed out so far.
    last_segment_id: u32,
    head_segment_writer: Option<SegmentFileWriter>,
}

impl SegmentedLog {
    /// Append a record to the log.
    ///
    /// After this function returned, the data is guaranteed to be persisted.
    pub fn append(&mut self, data: &[u8]) -> Result<RecordId> {
        if data.len() > MAX_RECORD_PAYLOAD_SIZE as usize {
            bail!("Record payload size is too large: {}", data.len());
        }

        let new_segment = match self.head_segment_writer {
            None => true,
            Some(ref w) => w.file_size() >= self.max_segment_size,
        };
        if new_segment {
            self.create_segment()?;
        }

        let record_id = self.end_live.next();
        // UNWRAP: the head segment writer was created above if missing.
        let writer = self.head_segment_writer.as_mut().unwrap();
        writer.write_record(record_id, data)?;
        writer.fsync()?;

        if new_segment {
            // The new file name must be durable too.
            self.root_dir_fd.sync_all()?;
        }

        self.end_live = record_id;
        if self.start_live.is_nil() {
            self.start_live = record_id;
        }
        Ok(record_id)
    }

    fn create_segment(&mut self) -> Result<()> {
        let id = self.last_segment_id.wrapping_add(1).max(1);
        let path = self
            .root_dir_path
            .join(segment_filename::format(&self.filename_prefix, id));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        // Replace the ex-head segment writer, closing it.
        self.head_segment_writer = Some(SegmentFileWriter::new(file, 0));
        self.segments.push(Segment { id, path });
        self.last_segment_id = id;
        Ok(())
    }

    /// Call `f` with every record of the log, oldest first.
    pub fn for_each_record<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(RecordId, &[u8]) -> Result<()>,
    {
        let mut payload = Vec::new();
        for segment in &self.segments {
            let mut reader = SegmentFileReader::new(File::open(&segment.path)?)?;
            loop {
                match reader.read_record(&mut payload)? {
                    ReadRecord::Record(id) => f(id, &payload)?,
                    ReadRecord::End => break,
                    ReadRecord::Torn => bail!(
                        "segment {} damaged at offset {}",
                        segment.path.display(),
                        reader.record_start()
                    ),
                }
            }
        }
        Ok(())
    }

    /// Remove every record from the log, deleting all segment files.
    ///
    /// Record and segment ids keep counting up from where they were.
    pub fn prune_all(&mut self) -> Result<()> {
        let _ = self.head_segment_writer.take();
        if self.segments.is_empty() {
            return Ok(());
        }
        for segment in self.segments.drain(..) {
            fs::remove_file(&segment.path)?;
        }
        self.root_dir_fd.sync_all()?;
        self.start_live = RecordId::nil();
        Ok(())
    }

    /// Whether the log holds no records.
    pub fn is_empty(&self) -> bool {
        self.start_live.is_nil()
    }

    /// The first and last record ids in the log, `(0, 0)` if empty.
    pub fn live_range(&self) -> (RecordId, RecordId) {
        if self.is_empty() {
            (RecordId::nil(), RecordId::nil())
        } else {
            (self.start_live, self.end_live)
        }
    }

    /// The number of segment files.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

fn scan_root_dir(root_dir_path: &Path, filename_prefix: &str) -> Result<Vec<Segment>> {
    let segment_prefix = format!("{filename_prefix}.");
    let mut segments = Vec::new();
    for entry in fs::read_dir(root_dir_path)? {
        let entry = entry?;
        let filename = entry.file_name();
        let Some(filename) = filename.to_str() else {
            continue;
        };
        if !filename.starts_with(&segment_prefix) {
            continue;
        }
        let id = segment_filename::parse(filename_prefix, filename)?;
        if id == 0 {
            bail!("Segment ID is nil, file: {}", entry.path().display());
        }
        segments.push(Segment {
            id,
            path: entry.path(),
        });
    }
    segments.sort_by_key(|s| s.id);
    for pair in segments.windows(2) {
        if pair[1].id != pair[0].id + 1 {
            bail!("Gap in segment IDs: this {}, last {}", pair[1].id, pair[0].id);
        }
    }
    Ok(segments)
}

/// Opens a segmented log, passing every intact record to `process_record`, oldest first.
///
/// The first torn record ends the log: its segment is truncated right before it and all newer
/// segments are deleted.
pub fn open<F>(
    root_dir_path: PathBuf,
    root_dir_fd: Arc<File>,
    filename_prefix: String,
    max_segment_size: u64,
    mut process_record: F,
) -> Result<SegmentedLog>
where
    F: FnMut(RecordId, &[u8]) -> Result<()>,
{
    let mut segments = scan_root_dir(&root_dir_path, &filename_prefix)?;

    let mut start_live = RecordId::nil();
    let mut end_live = RecordId::nil();
    let mut payload = Vec::new();
    let mut torn_at: Option<(usize, u64)> = None;
    let mut head_size = 0;

    'segments: for (index, segment) in segments.iter().enumerate() {
        let mut reader = SegmentFileReader::new(File::open(&segment.path)?)?;
        loop {
            match reader.read_record(&mut payload)? {
                ReadRecord::Record(id) => {
                    if !end_live.is_nil() && id != end_live.next() {
                        bail!(
                            "IDs are not ordered: this {}, expected {}",
                            id,
                            end_live.next()
                        );
                    }
                    process_record(id, &payload)?;
                    if start_live.is_nil() {
                        start_live = id;
                    }
                    end_live = id;
                }
                ReadRecord::End => {
                    head_size = reader.record_start();
                    break;
                }
                ReadRecord::Torn => {
                    torn_at = Some((index, reader.record_start()));
                    break 'segments;
                }
            }
        }
    }

    if let Some((index, offset)) = torn_at {
        tracing::warn!(
            prefix = %filename_prefix,
            segment = segments[index].id,
            offset,
            "truncating torn log tail"
        );
        for segment in segments.drain(index + 1..) {
            fs::remove_file(&segment.path)?;
        }
        let file = OpenOptions::new().write(true).open(&segments[index].path)?;
        file.set_len(offset)?;
        file.sync_all()?;
        root_dir_fd.sync_all()?;
        head_size = offset;
    }

    let last_segment_id = segments.last().map_or(0, |s| s.id);
    let head_segment_writer = match segments.last() {
        Some(head) => {
            let file = OpenOptions::new().append(true).open(&head.path)?;
            Some(SegmentFileWriter::new(file, head_size))
        }
        None => None,
    };

    Ok(SegmentedLog {
        root_dir_path,
        root_dir_fd,
        filename_prefix,
        max_segment_size,
        start_live,
        end_live,
        segments,
        last_segment_id,
        head_segment_writer,
    })
}
