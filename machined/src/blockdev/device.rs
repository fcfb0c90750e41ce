//! Block device handle with the ioctls the installer and META need.

use crate::constants::timeouts;
use crate::util::retry::{Retry, expected, unexpected};
use machined_shared::{MachinedError, MachinedResult};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

mod ioctl {
    nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
    nix::ioctl_none!(blkrrpart, 0x12, 95);
    nix::ioctl_none!(blkflsbuf, 0x12, 97);
}

/// An open block device (or disk image file).
#[derive(Debug)]
pub struct BlockDevice {
    path: PathBuf,
    file: File,
}

impl BlockDevice {
    /// Open read-write.
    pub fn open(path: impl AsRef<Path>) -> MachinedResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| {
                MachinedError::Storage(format!("failed to open {}: {}", path.display(), e))
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Open read-only.
    pub fn open_read_only(path: impl AsRef<Path>) -> MachinedResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| {
                MachinedError::Storage(format!("failed to open {}: {}", path.display(), e))
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Open with `O_EXCL`, which the kernel refuses with `EBUSY` while any
    /// partition of the device is mounted or claimed.
    pub fn open_exclusive(path: impl AsRef<Path>) -> Result<Self, Errno> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_EXCL | libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn into_file(self) -> File {
        self.file
    }

    fn is_block_device(&self) -> MachinedResult<bool> {
        Ok(self.file.metadata()?.file_type().is_block_device())
    }

    /// Size in bytes. Regular files report their length.
    pub fn size(&self) -> MachinedResult<u64> {
        if !self.is_block_device()? {
            return Ok(self.file.metadata()?.len());
        }

        let mut size: u64 = 0;
        // SAFETY: fd is valid for the lifetime of self, size is a valid out pointer.
        unsafe { ioctl::blkgetsize64(self.file.as_raw_fd(), &mut size) }.map_err(|e| {
            MachinedError::Storage(format!(
                "BLKGETSIZE64 on {} failed: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(size)
    }

    /// Ask the kernel to re-read the partition table once.
    pub fn reread_partitions(&self) -> Result<(), Errno> {
        if !self.is_block_device().unwrap_or(false) {
            return Ok(());
        }
        // SAFETY: fd is valid for the lifetime of self.
        unsafe { ioctl::blkrrpart(self.file.as_raw_fd()) }.map(|_| ())
    }

    /// Re-read the partition table, retrying while the device is busy.
    pub fn reread_partitions_with_retry(&self) -> MachinedResult<()> {
        Retry::constant(
            timeouts::PARTITION_REREAD,
            timeouts::PARTITION_REREAD_INTERVAL,
        )
        .retry(|| match self.reread_partitions() {
            Ok(()) => Ok(()),
            Err(Errno::EBUSY) => Err(expected(Errno::EBUSY)),
            Err(e) => Err(unexpected(e)),
        })
    }

    /// Flush the buffer cache of the device.
    pub fn flush_buffers(&self) -> MachinedResult<()> {
        if !self.is_block_device()? {
            return Ok(());
        }
        // SAFETY: fd is valid for the lifetime of self.
        unsafe { ioctl::blkflsbuf(self.file.as_raw_fd()) }.map_err(|e| {
            MachinedError::Storage(format!("BLKFLSBUF on {} failed: {}", self.path.display(), e))
        })?;
        Ok(())
    }

    /// Overwrite `len` bytes starting at `offset` with zeros.
    pub fn zero_range(&mut self, offset: u64, len: u64) -> MachinedResult<()> {
        const CHUNK: usize = 1024 * 1024;
        let zeros = vec![0u8; CHUNK];

        self.file.seek(SeekFrom::Start(offset))?;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(CHUNK as u64) as usize;
            self.file.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// Zero the whole device.
    pub fn zero(&mut self) -> MachinedResult<()> {
        let size = self.size()?;
        tracing::info!(device = %self.path.display(), size, "Zeroing device");
        self.zero_range(0, size)
    }
}

/// Take an advisory lock on `path`, blocking until granted.
///
/// The lock is released when the returned guard is dropped.
pub fn lock(path: impl AsRef<Path>, exclusive: bool) -> MachinedResult<Flock<File>> {
    let path = path.as_ref();
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
        .map_err(|e| MachinedError::Storage(format!("failed to open {}: {}", path.display(), e)))?;

    let arg = if exclusive {
        FlockArg::LockExclusive
    } else {
        FlockArg::LockShared
    };

    Flock::lock(file, arg).map_err(|(_, errno)| {
        MachinedError::Storage(format!("flock on {} failed: {}", path.display(), errno))
    })
}
