//! Checks run before touching the install disk.

use crate::blockdev::BlockDevice;
use crate::constants::layout;
use crate::runtime::Mode;
use machined_shared::{MachinedError, MachinedResult};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// Verify `disk` can take an install in `mode`. Returns the disk size.
pub fn check(disk: &str, mode: Mode) -> MachinedResult<u64> {
    check_with_minimum(disk, mode, layout::MIN_DISK_SIZE)
}

pub fn check_with_minimum(disk: &str, mode: Mode, minimum: u64) -> MachinedResult<u64> {
    if mode.is_container() {
        return Err(MachinedError::Precondition(
            "installation is not supported in container mode".to_string(),
        ));
    }

    let metadata = std::fs::metadata(Path::new(disk)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            MachinedError::NotFound(format!("install disk {}", disk))
        } else {
            MachinedError::Io(e)
        }
    })?;

    let file_type = metadata.file_type();
    if !file_type.is_block_device() && !file_type.is_file() {
        return Err(MachinedError::Precondition(format!(
            "{} is neither a block device nor an image file",
            disk
        )));
    }

    let size = BlockDevice::open_read_only(disk)?.size()?;
    if size < minimum {
        return Err(MachinedError::Precondition(format!(
            "{} is too small: {} bytes, need at least {}",
            disk, size, minimum
        )));
    }

    tracing::debug!(disk, size, "Install disk passed preflight");
    Ok(size)
}
