//! Disk access used by the installer.

use crate::blockdev::{self, BlockDevice, Prober};
use crate::constants::{layout, paths, timeouts};
use crate::mount::{Point, table};
use crate::util::retry::{Retry, expected, unexpected};
use machined_shared::{MachinedError, MachinedResult};
use nix::errno::Errno;
use nix::mount::MsFlags;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{info, warn};

/// Operations the installer performs on disks and partitions.
pub trait DiskOps: Send + Sync {
    /// Size of `disk` in bytes.
    fn size(&self, disk: &str) -> MachinedResult<u64>;

    /// Make the kernel pick up a new partition table.
    fn reread(&self, disk: &str) -> MachinedResult<()>;

    /// Overwrite the whole disk with zeros.
    fn zero(&self, disk: &str) -> MachinedResult<()>;

    fn write_at(&self, disk: &str, offset: u64, bytes: &[u8]) -> MachinedResult<()>;

    /// Device node of partition `number` on `disk`.
    fn partition_path(&self, disk: &str, number: u32) -> MachinedResult<String>;

    /// Partition carrying `label`, if any.
    fn find_by_label(&self, label: &str) -> MachinedResult<Option<String>>;

    fn mount(&self, source: &str, target: &Path, fstype: &str) -> MachinedResult<()>;

    fn unmount(&self, target: &Path) -> MachinedResult<()>;
}

/// [`DiskOps`] on the real block devices of the host.
#[derive(Debug, Clone, Default)]
pub struct HostDisks {
    prober: Prober,
}

impl HostDisks {
    pub fn new(prober: Prober) -> Self {
        Self { prober }
    }
}

impl DiskOps for HostDisks {
    fn size(&self, disk: &str) -> MachinedResult<u64> {
        BlockDevice::open_read_only(disk)?.size()
    }

    fn reread(&self, disk: &str) -> MachinedResult<()> {
        BlockDevice::open_read_only(disk)?.reread_partitions_with_retry()
    }

    fn zero(&self, disk: &str) -> MachinedResult<()> {
        BlockDevice::open(disk)?.zero()
    }

    fn write_at(&self, disk: &str, offset: u64, bytes: &[u8]) -> MachinedResult<()> {
        let mut device = BlockDevice::open(disk)?;
        let file = device.file_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    }

    fn partition_path(&self, disk: &str, number: u32) -> MachinedResult<String> {
        blockdev::partition_path(disk, number)
    }

    fn find_by_label(&self, label: &str) -> MachinedResult<Option<String>> {
        match self.prober.find_by_label(label) {
            Ok(path) => Ok(Some(path.to_string_lossy().into_owned())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn mount(&self, source: &str, target: &Path, fstype: &str) -> MachinedResult<()> {
        Point::new(
            source,
            target.to_string_lossy(),
            fstype,
            MsFlags::empty(),
            "",
        )
        .mount()
        .map(|_| ())
    }

    fn unmount(&self, target: &Path) -> MachinedResult<()> {
        Point::new("", target.to_string_lossy(), "", MsFlags::empty(), "").unmount()
    }
}

/// Wipe the partition table of `disk` so the next boot starts from scratch.
pub fn reset_device(disk: impl AsRef<Path>) -> MachinedResult<()> {
    let disk = disk.as_ref();
    info!(disk = %disk.display(), "Resetting system disk");

    let mut device = BlockDevice::open(disk)?;
    device.zero_range(0, layout::GPT_HEADER_REGION)?;
    device.reread_partitions_with_retry()
}

/// Wait until nothing holds `device` open.
///
/// The current mount table is logged once on the first busy attempt.
pub fn verify_disk_free(device: impl AsRef<Path>) -> MachinedResult<()> {
    verify_disk_free_with(
        device,
        Retry::constant(timeouts::VERIFY_DISK_FREE, timeouts::VERIFY_DISK_FREE_INTERVAL),
    )
}

pub fn verify_disk_free_with(device: impl AsRef<Path>, retry: Retry) -> MachinedResult<()> {
    let device = device.as_ref();
    let mut dumped = false;

    retry
        .retry(|| match BlockDevice::open_exclusive(device) {
            Ok(_) => Ok(()),
            Err(Errno::EBUSY) => {
                if !dumped {
                    dumped = true;
                    dump_mounts();
                }
                Err(expected(Errno::EBUSY))
            }
            Err(e) => Err(unexpected(e)),
        })
        .map_err(|e| {
            MachinedError::Storage(format!(
                "disk {} is not free: {}",
                device.display(),
                e
            ))
        })
}

fn dump_mounts() {
    match table::read_from(paths::PROC_MOUNTS) {
        Ok(entries) => {
            warn!("Disk is busy, current mounts:");
            for entry in entries {
                warn!(source = %entry.source, target = %entry.target, fstype = %entry.fstype, "mount");
            }
        }
        Err(e) => warn!(error = %e, "Failed to read mount table"),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Duration;

    #[test]
    fn test_reset_device_zeroes_header() {
        let image = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(image.path(), vec![0xabu8; 64 * 1024]).unwrap();

        reset_device(image.path()).unwrap();

        let mut contents = Vec::new();
        std::fs::File::open(image.path())
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        let header = layout::GPT_HEADER_REGION as usize;
        assert!(contents[..header].iter().all(|b| *b == 0));
        assert!(contents[header..].iter().all(|b| *b == 0xab));
    }

    #[test]
    fn test_verify_disk_free_on_unused_image() {
        let image = tempfile::NamedTempFile::new().unwrap();
        verify_disk_free_with(
            image.path(),
            Retry::constant(Duration::from_millis(100), Duration::from_millis(10)),
        )
        .unwrap();
    }

    #[test]
    fn test_verify_disk_free_missing_device() {
        let err = verify_disk_free_with(
            "/nonexistent/disk",
            Retry::constant(Duration::from_millis(100), Duration::from_millis(10)),
        )
        .unwrap_err();
        assert!(matches!(err, MachinedError::Storage(_)));
    }
}
