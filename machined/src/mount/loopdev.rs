//! Loop device attachment for the squashfs rootfs.

use machined_shared::{MachinedError, MachinedResult};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const LOOP_CONTROL: &str = "/dev/loop-control";

mod ioctl {
    nix::ioctl_none_bad!(loop_ctl_get_free, 0x4C82);
    nix::ioctl_write_int_bad!(loop_set_fd, 0x4C00);
    nix::ioctl_none_bad!(loop_clr_fd, 0x4C01);
}

/// A backing file attached to a loop device.
#[derive(Debug)]
pub struct LoopDevice {
    path: PathBuf,
    // Keeps the device node open while attached.
    device: File,
}

impl LoopDevice {
    /// Attach `backing` read-only to the next free loop device.
    pub fn attach(backing: impl AsRef<Path>) -> MachinedResult<Self> {
        let backing = backing.as_ref();
        let control = File::open(LOOP_CONTROL)
            .map_err(|e| MachinedError::Storage(format!("failed to open {}: {}", LOOP_CONTROL, e)))?;

        // SAFETY: control is a valid open fd.
        let index = unsafe { ioctl::loop_ctl_get_free(control.as_raw_fd()) }
            .map_err(|e| MachinedError::Storage(format!("LOOP_CTL_GET_FREE failed: {}", e)))?;

        let path = PathBuf::from(format!("/dev/loop{}", index));
        let device = OpenOptions::new().read(true).open(&path).map_err(|e| {
            MachinedError::Storage(format!("failed to open {}: {}", path.display(), e))
        })?;
        let file = File::open(backing).map_err(|e| {
            MachinedError::Storage(format!("failed to open {}: {}", backing.display(), e))
        })?;

        // SAFETY: both fds are valid; the kernel takes its own reference to the backing file.
        unsafe { ioctl::loop_set_fd(device.as_raw_fd(), file.as_raw_fd()) }.map_err(|e| {
            MachinedError::Storage(format!(
                "LOOP_SET_FD {} on {} failed: {}",
                backing.display(),
                path.display(),
                e
            ))
        })?;

        tracing::info!(backing = %backing.display(), device = %path.display(), "Attached loop device");
        Ok(Self {
            path,
            device,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detach the backing file.
    pub fn detach(self) -> MachinedResult<()> {
        // SAFETY: the fd is valid until self is dropped.
        unsafe { ioctl::loop_clr_fd(self.device.as_raw_fd()) }
            .map_err(|e| MachinedError::Storage(format!("LOOP_CLR_FD failed: {}", e)))?;
        Ok(())
    }
}
