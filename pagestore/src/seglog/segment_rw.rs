use anyhow::Result;
use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom, Write},
};

use super::{RecordHeader, RecordId, HEADER_SIZE, MAX_RECORD_PAYLOAD_SIZE, RECORD_ALIGNMENT};

fn align_up(pos: u64) -> u64 {
    let alignment = RECORD_ALIGNMENT as u64;
    pos.div_ceil(alignment) * alignment
}

pub struct SegmentFileWriter {
    /// The segment file, positioned at its end.
    file: File,
    /// The size of the segment file in bytes. Always a multiple of the record alignment.
    file_size: u64,
}

impl SegmentFileWriter {
    pub fn new(file: File, file_size: u64) -> Self {
        Self { file, file_size }
    }

    /// Write one record and pad the file up to the next record boundary.
    pub fn write_record(&mut self, record_id: RecordId, payload: &[u8]) -> Result<()> {
        let header = RecordHeader {
            payload_length: payload.len() as u32,
            record_id,
            checksum: crc32fast::hash(payload),
        };
        self.file.write_all(&header.encode())?;
        self.file.write_all(payload)?;

        let next_pos = align_up(self.file_size + HEADER_SIZE as u64 + payload.len() as u64);
        // Seeking alone does not grow the file.
        self.file.set_len(next_pos)?;
        self.file.seek(SeekFrom::Start(next_pos))?;
        self.file_size = next_pos;
        Ok(())
    }

    pub fn fsync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}

/// The outcome of reading the next record of a segment.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadRecord {
    /// A complete record with a valid checksum.
    Record(RecordId),
    /// The end of the file was reached cleanly.
    End,
    /// The record at [`SegmentFileReader::record_start`] is incomplete or fails its checksum.
    Torn,
}

pub struct SegmentFileReader {
    buf_reader: BufReader<File>,
    /// The offset of the record last returned or found torn.
    record_start: u64,
    /// The offset of the next record.
    next_pos: u64,
    file_size: u64,
}

impl SegmentFileReader {
    pub fn new(file: File) -> Result<Self> {
        let file_size = file.metadata()?.len();
        Ok(Self {
            buf_reader: BufReader::new(file),
            record_start: 0,
            next_pos: 0,
            file_size,
        })
    }

    /// Read the next record into `payload`.
    pub fn read_record(&mut self, payload: &mut Vec<u8>) -> Result<ReadRecord> {
        let pos = self.next_pos;
        self.record_start = pos;
        if pos >= self.file_size {
            return Ok(ReadRecord::End);
        }
        if self.file_size - pos < HEADER_SIZE as u64 {
            return Ok(ReadRecord::Torn);
        }

        self.buf_reader.seek(SeekFrom::Start(pos))?;
        let mut raw = [0u8; HEADER_SIZE as usize];
        self.buf_reader.read_exact(&mut raw)?;
        let header = RecordHeader::decode(&raw);

        // A zeroed header is the padding of a record that never made it to disk.
        if header.record_id.is_nil()
            || header.payload_length > MAX_RECORD_PAYLOAD_SIZE
            || pos + HEADER_SIZE as u64 + header.payload_length as u64 > self.file_size
        {
            return Ok(ReadRecord::Torn);
        }

        payload.resize(header.payload_length as usize, 0);
        self.buf_reader.read_exact(payload)?;
        if crc32fast::hash(payload) != header.checksum {
            return Ok(ReadRecord::Torn);
        }

        self.next_pos = align_up(pos + HEADER_SIZE as u64 + header.payload_length as u64);
        Ok(ReadRecord::Record(header.record_id))
    }

    /// The offset of the record last returned by [`Self::read_record`].
    pub fn record_start(&self) -> u64 {
        self.record_start
    }
}
