//! An advisory lock on the database directory.

use std::{
    fs::{File, OpenOptions},
    os::fd::AsRawFd as _,
    path::Path,
};

/// Holds an exclusive advisory lock on a directory until dropped.
pub struct Flock {
    lock_fd: File,
}

impl Flock {
    pub fn lock(db_dir: &Path, lock_filename: &str) -> anyhow::Result<Self> {
        let lock_path = db_dir.join(lock_filename);

        let lock_fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        match try_lock_exclusive(&lock_fd) {
            Ok(()) => Ok(Self { lock_fd }),
            Err(err) => {
                anyhow::bail!("Failed to lock directory {}: {err}", db_dir.display());
            }
        }
    }
}

impl Drop for Flock {
    fn drop(&mut self) {
        if let Err(e) = unlock(&self.lock_fd) {
            tracing::warn!("Failed to unlock directory lock: {e}");
        }
    }
}

fn try_lock_exclusive(file: &File) -> std::io::Result<()> {
    unsafe {
        if libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

fn unlock(file: &File) -> std::io::Result<()> {
    unsafe {
        if libc::flock(file.as_raw_fd(), libc::LOCK_UN) == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}
