//! Recovery log records and their encoding.

use anyhow::{bail, Result};
use pagestore_core::GroupTag;
use std::io::{Cursor, Read as _};

use crate::seglog::RecordId;

/// The position of a record in the recovery log of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogInstance {
    pub partition: u8,
    pub record_id: RecordId,
}

/// A record of the recovery log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A marker carrying no page image: checkpoint, commit or abort.
    Loggable { group: GroupTag, epoch: u64 },
    /// The durable image of `block` before the running transaction changed it.
    Undoable {
        group: GroupTag,
        epoch: u64,
        block: u64,
        before_image: Vec<u8>,
    },
    /// The reversal of the Undoable at `compensates`: `image` was written back to `block`.
    /// Never undone, only redone.
    Compensation {
        group: GroupTag,
        epoch: u64,
        block: u64,
        compensates: LogInstance,
        image: Vec<u8>,
    },
}

const KIND_LOGGABLE: u8 = 0;
const KIND_UNDOABLE: u8 = 1;
const KIND_COMPENSATION: u8 = 2;

impl LogRecord {
    pub fn group(&self) -> GroupTag {
        match self {
            LogRecord::Loggable { group, .. }
            | LogRecord::Undoable { group, .. }
            | LogRecord::Compensation { group, .. } => *group,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            LogRecord::Loggable { epoch, .. }
            | LogRecord::Undoable { epoch, .. }
            | LogRecord::Compensation { epoch, .. } => *epoch,
        }
    }

    /// The Compensation reversing this record, which must be an Undoable stored at `instance`.
    ///
    /// Returns `None` for any other kind of record.
    pub fn compensation(&self, instance: LogInstance) -> Option<LogRecord> {
        match self {
            LogRecord::Undoable {
                epoch,
                block,
                before_image,
                ..
            } => Some(LogRecord::Compensation {
                group: GroupTag::COMPENSATION | GroupTag::BEFORE_IMAGE,
                epoch: *epoch,
                block: *block,
                compensates: instance,
                image: before_image.clone(),
            }),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // kind u8 | group u8 | epoch u64, then per kind:
        //  Undoable:     block u64 | image_len u32 | image
        //  Compensation: block u64 | partition u8 | record_id u64 | image_len u32 | image
        let image = match self {
            LogRecord::Loggable { .. } => &[][..],
            LogRecord::Undoable { before_image, .. } => &before_image[..],
            LogRecord::Compensation { image, .. } => &image[..],
        };
        let mut buf = Vec::with_capacity(32 + image.len());
        let kind = match self {
            LogRecord::Loggable { .. } => KIND_LOGGABLE,
            LogRecord::Undoable { .. } => KIND_UNDOABLE,
            LogRecord::Compensation { .. } => KIND_COMPENSATION,
        };
        buf.push(kind);
        buf.push(self.group().bits());
        buf.extend_from_slice(&self.epoch().to_le_bytes());

        match self {
            LogRecord::Loggable { .. } => return buf,
            LogRecord::Undoable { block, .. } => {
                buf.extend_from_slice(&block.to_le_bytes());
            }
            LogRecord::Compensation {
                block, compensates, ..
            } => {
                buf.extend_from_slice(&block.to_le_bytes());
                buf.push(compensates.partition);
                buf.extend_from_slice(&compensates.record_id.0.to_le_bytes());
            }
        }
        buf.extend_from_slice(&(image.len() as u32).to_le_bytes());
        buf.extend_from_slice(image);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(bytes);
        let mut b1 = [0u8; 1];
        let mut b4 = [0u8; 4];
        let mut b8 = [0u8; 8];

        reader.read_exact(&mut b1)?;
        let kind = b1[0];
        reader.read_exact(&mut b1)?;
        let Some(group) = GroupTag::from_bits(b1[0]) else {
            bail!("unknown group flags {:#010b}", b1[0]);
        };
        reader.read_exact(&mut b8)?;
        let epoch = u64::from_le_bytes(b8);

        let mut read_image = |reader: &mut Cursor<&[u8]>| -> Result<Vec<u8>> {
            reader.read_exact(&mut b4)?;
            let mut image = vec![0u8; u32::from_le_bytes(b4) as usize];
            reader.read_exact(&mut image)?;
            Ok(image)
        };

        let record = match kind {
            KIND_LOGGABLE => LogRecord::Loggable { group, epoch },
            KIND_UNDOABLE => {
                reader.read_exact(&mut b8)?;
                let block = u64::from_le_bytes(b8);
                let before_image = read_image(&mut reader)?;
                LogRecord::Undoable {
                    group,
                    epoch,
                    block,
                    before_image,
                }
            }
            KIND_COMPENSATION => {
                reader.read_exact(&mut b8)?;
                let block = u64::from_le_bytes(b8);
                reader.read_exact(&mut b1)?;
                let partition = b1[0];
                reader.read_exact(&mut b8)?;
                let record_id = RecordId(u64::from_le_bytes(b8));
                let image = read_image(&mut reader)?;
                LogRecord::Compensation {
                    group,
                    epoch,
                    block,
                    compensates: LogInstance {
                        partition,
                        record_id,
                    },
                    image,
                }
            }
            other => bail!("unknown record kind {other}"),
        };

        if reader.position() as usize != bytes.len() {
            bail!(
                "{} trailing bytes after log record",
                bytes.len() - reader.position() as usize
            );
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undoable_and_its_compensation() {
        let undo = LogRecord::Undoable {
            group: GroupTag::FIRST | GroupTag::BEFORE_IMAGE,
            epoch: 3,
            block: 12,
            before_image: vec![9; 512],
        };
        let encoded = undo.encode();
        assert_eq!(encoded.len(), 1 + 1 + 8 + 8 + 4 + 512);
        assert_eq!(LogRecord::decode(&encoded).unwrap(), undo);

        let at = LogInstance {
            partition: 2,
            record_id: RecordId(7),
        };
        let comp = undo.compensation(at).unwrap();
        assert!(comp.group().contains(GroupTag::COMPENSATION));
        match &comp {
            LogRecord::Compensation {
                block,
                compensates,
                image,
                epoch,
                ..
            } => {
                assert_eq!(*block, 12);
                assert_eq!(*compensates, at);
                assert_eq!(image, &vec![9; 512]);
                assert_eq!(*epoch, 3);
            }
            other => panic!("unexpected record {other:?}"),
        }
        assert_eq!(LogRecord::decode(&comp.encode()).unwrap(), comp);
        assert!(comp.compensation(at).is_none());
    }

    #[test]
    fn marker_is_ten_bytes() {
        let marker = LogRecord::Loggable {
            group: GroupTag::CHECKPOINT,
            epoch: 1,
        };
        let encoded = marker.encode();
        assert_eq!(encoded.len(), 10);
        assert_eq!(LogRecord::decode(&encoded).unwrap(), marker);
    }

    #[test]
    fn rejects_garbage() {
        assert!(LogRecord::decode(&[]).is_err());
        assert!(LogRecord::decode(&[7, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(LogRecord::decode(&[0, 0x80, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());

        let mut encoded = LogRecord::Loggable {
            group: GroupTag::COMMIT,
            epoch: 1,
        }
        .encode();
        encoded.push(0);
        assert!(LogRecord::decode(&encoded).is_err());

        let encoded = LogRecord::Undoable {
            group: GroupTag::BEFORE_IMAGE,
            epoch: 1,
            block: 0,
            before_image: vec![1; 10],
        }
        .encode();
        assert!(LogRecord::decode(&encoded[..encoded.len() - 1]).is_err());
    }
}
