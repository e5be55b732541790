//! Backing stores of a partition file.

use memmap2::{MmapMut, MmapOptions};
use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::FileExt as _,
    path::Path,
};

use crate::options::BackingMode;

/// Byte-addressed access to one partition file.
///
/// Only ever used from the partition's I/O worker thread.
pub trait Backing: Send {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;
    /// The file length in bytes.
    fn len(&self) -> u64;
    fn set_len(&mut self, len: u64) -> io::Result<()>;
    /// Durability barrier: returns once everything written so far is on stable storage.
    fn sync(&mut self) -> io::Result<()>;
}

/// Open or create the file at `path` with the given access mode.
pub fn open(path: &Path, mode: BackingMode) -> io::Result<Box<dyn Backing>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let len = file.metadata()?.len();
    Ok(match mode {
        BackingMode::PlainFile => Box::new(FileBacking { file, len }),
        BackingMode::MemoryMapped => {
            let map = map_file(&file, len)?;
            Box::new(MmapBacking { file, map, len })
        }
    })
}

fn out_of_range(offset: u64, len: usize, file_len: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("range {offset}+{len} beyond end of file at {file_len}"),
    )
}

pub struct FileBacking {
    file: File,
    len: u64,
}

impl Backing for FileBacking {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)?;
        self.len = self.len.max(offset + buf.len() as u64);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                // fdatasync also persists a changed file size.
                self.file.sync_data()
            } else {
                self.file.sync_all()
            }
        }
    }
}

fn map_file(file: &File, len: u64) -> io::Result<Option<MmapMut>> {
    if len == 0 {
        // Zero-length mappings are rejected by the OS.
        return Ok(None);
    }
    // SAFETY: the file is owned by the worker thread for the lifetime of the mapping and is
    // never resized while the mapping is alive.
    let map = unsafe { MmapOptions::new().len(len as usize).map_mut(file)? };
    Ok(Some(map))
}

/// A shared writable mapping of the partition file, remapped whenever the file changes length.
pub struct MmapBacking {
    file: File,
    map: Option<MmapMut>,
    len: u64,
}

impl Backing for MmapBacking {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let end = offset + buf.len() as u64;
        match self.map {
            Some(ref map) if end <= self.len => {
                buf.copy_from_slice(&map[offset as usize..end as usize]);
                Ok(())
            }
            _ => Err(out_of_range(offset, buf.len(), self.len)),
        }
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.len {
            self.set_len(end)?;
        }
        match self.map {
            Some(ref mut map) => {
                map[offset as usize..end as usize].copy_from_slice(buf);
                Ok(())
            }
            None => Err(out_of_range(offset, buf.len(), self.len)),
        }
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        if let Some(map) = self.map.take() {
            map.flush()?;
        }
        self.file.set_len(len)?;
        self.len = len;
        self.map = map_file(&self.file, len)?;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        if let Some(ref map) = self.map {
            map.flush()?;
        }
        self.file.sync_all()
    }
}
