//! A single mount point.

use super::table;
use crate::blockdev::{self, BlockDevice, PartitionTable, probe_filesystem};
use crate::constants::{paths, timeouts};
use crate::util::process::{CommandRunner, SystemCommandRunner, args};
use crate::util::retry::{Retry, RetryError, expected, unexpected};
use bitflags::bitflags;
use machined_shared::{MachinedError, MachinedResult};
use nix::errno::Errno;
use nix::mount::{MsFlags, mount};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

bitflags! {
    /// Behavior switches of a [`Point`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PointFlags: u32 {
        const READ_ONLY = 1 << 0;
        const SHARED = 1 << 1;
        const OVERLAY = 1 << 2;
        const READONLY_OVERLAY = 1 << 3;
        const RESIZE = 1 << 4;
        const SKIP_IF_MOUNTED = 1 << 5;
        const SKIP_IF_NO_FILESYSTEM = 1 << 6;
        const SKIP_IF_NO_DEVICE = 1 << 7;
    }
}

/// Hook run around mount and unmount.
pub type Hook = Arc<dyn Fn(&Point) -> MachinedResult<()> + Send + Sync>;

/// What [`Point::mount`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    Mounted,
    Skipped,
}

#[derive(Clone)]
pub struct Point {
    source: String,
    target: String,
    fstype: String,
    flags: MsFlags,
    data: String,
    options: PointFlags,
    prefix: Option<String>,
    overlays_root: PathBuf,
    pre_mount_hooks: Vec<Hook>,
    post_unmount_hooks: Vec<Hook>,
    runner: Arc<dyn CommandRunner>,
}

impl fmt::Debug for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point")
            .field("source", &self.source)
            .field("target", &self.target())
            .field("fstype", &self.fstype)
            .field("flags", &self.flags)
            .field("data", &self.data)
            .field("options", &self.options)
            .finish()
    }
}

impl Point {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        fstype: impl Into<String>,
        flags: MsFlags,
        data: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: fstype.into(),
            flags,
            data: data.into(),
            options: PointFlags::empty(),
            prefix: None,
            overlays_root: PathBuf::from(paths::SYSTEM_OVERLAYS_PATH),
            pre_mount_hooks: Vec::new(),
            post_unmount_hooks: Vec::new(),
            runner: Arc::new(SystemCommandRunner),
        }
    }

    /// Writable overlay on top of `target`.
    pub fn overlay(target: impl Into<String>) -> Self {
        Self::new("overlay", target, "overlay", MsFlags::empty(), "")
            .with_options(PointFlags::OVERLAY)
    }

    /// Read-only overlay stacking `lowers` at `target`.
    pub fn readonly_overlay(lowers: &[&str], target: impl Into<String>) -> Self {
        Self::new(lowers.join(":"), target, "overlay", MsFlags::MS_RDONLY, "")
            .with_options(PointFlags::READONLY_OVERLAY)
    }

    pub fn with_options(mut self, options: PointFlags) -> Self {
        self.options |= options;
        if options.contains(PointFlags::READ_ONLY) {
            self.flags |= MsFlags::MS_RDONLY;
        }
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_overlays_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.overlays_root = root.into();
        self
    }

    pub fn with_pre_mount_hook(mut self, hook: Hook) -> Self {
        self.pre_mount_hooks.push(hook);
        self
    }

    pub fn with_post_unmount_hook(mut self, hook: Hook) -> Self {
        self.post_unmount_hooks.push(hook);
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn fstype(&self) -> &str {
        &self.fstype
    }

    pub fn flags(&self) -> MsFlags {
        self.flags
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn options(&self) -> PointFlags {
        self.options
    }

    /// Target without the prefix.
    pub fn raw_target(&self) -> &str {
        &self.target
    }

    /// Effective target, prefix applied.
    pub fn target(&self) -> String {
        match &self.prefix {
            Some(prefix) => join(prefix, &self.target),
            None => self.target.clone(),
        }
    }

    /// Rewrite the target in place to live under `prefix`.
    pub fn prefix_target(&mut self, prefix: &str) {
        self.target = join(prefix, &self.target);
    }

    /// Upper and work directories of an overlay point.
    pub fn overlay_dirs(&self) -> (PathBuf, PathBuf) {
        let name = self.target.trim_start_matches('/').replace('/', "-");
        (
            self.overlays_root.join(format!("{}-diff", name)),
            self.overlays_root.join(format!("{}-workdir", name)),
        )
    }

    pub fn is_mounted(&self) -> MachinedResult<bool> {
        table::is_mounted(&self.target())
    }

    /// Mount, honoring every skip, overlay, share and resize option.
    pub fn mount(&self) -> MachinedResult<MountOutcome> {
        let target = self.target();

        if self.options.contains(PointFlags::SKIP_IF_MOUNTED) && self.is_mounted()? {
            debug!(target = %target, "Already mounted, skipping");
            return Ok(MountOutcome::Skipped);
        }

        if self.options.contains(PointFlags::SKIP_IF_NO_FILESYSTEM)
            && probe_filesystem(&self.source)?.is_none()
        {
            debug!(source = %self.source, "No filesystem, skipping");
            return Ok(MountOutcome::Skipped);
        }

        if self.options.contains(PointFlags::SKIP_IF_NO_DEVICE)
            && let Some(parent) = Path::new(&target).parent()
            && !parent.exists()
        {
            debug!(target = %target, "Parent missing, skipping");
            return Ok(MountOutcome::Skipped);
        }

        for hook in &self.pre_mount_hooks {
            hook(self)?;
        }

        let resized = if self.options.contains(PointFlags::RESIZE) {
            self.resize_partition()?
        } else {
            false
        };

        std::fs::create_dir_all(&target).map_err(|e| {
            MachinedError::Mount(format!("failed to create mount point {}: {}", target, e))
        })?;

        let (source, data) = if self.options.contains(PointFlags::OVERLAY) {
            let (upper, work) = self.overlay_dirs();
            for dir in [&upper, &work] {
                std::fs::create_dir_all(dir)?;
            }
            (
                "overlay".to_string(),
                format!(
                    "lowerdir={},upperdir={},workdir={}",
                    target,
                    upper.display(),
                    work.display()
                ),
            )
        } else if self.options.contains(PointFlags::READONLY_OVERLAY) {
            ("overlay".to_string(), format!("lowerdir={}", self.source))
        } else {
            (self.source.clone(), self.data.clone())
        };

        let result = self.retry(|| {
            mount(
                Some(source.as_str()),
                target.as_str(),
                Some(self.fstype.as_str()),
                self.flags,
                (!data.is_empty()).then_some(data.as_str()),
            )
        });

        match result {
            Ok(()) => {}
            Err(MachinedError::Errno(Errno::ENODEV))
                if self.options.contains(PointFlags::SKIP_IF_NO_DEVICE) =>
            {
                debug!(target = %target, "No device, skipping");
                return Ok(MountOutcome::Skipped);
            }
            Err(e) => {
                return Err(MachinedError::Mount(format!(
                    "error mounting {} at {}: {}",
                    self.source, target, e
                )));
            }
        }

        if self.options.contains(PointFlags::SHARED) {
            self.share()?;
        }

        if resized {
            self.grow_filesystem()?;
        }

        debug!(source = %self.source, target = %target, fstype = %self.fstype, "Mounted");
        Ok(MountOutcome::Mounted)
    }

    /// Unmount with retry, then run post-unmount hooks.
    pub fn unmount(&self) -> MachinedResult<()> {
        let target = self.target();

        if self.is_mounted()? {
            Retry::constant(timeouts::MOUNT_RETRY, timeouts::MOUNT_RETRY_INTERVAL)
                .retry(|| match super::unmount::safe_unmount(&target) {
                    Ok(()) => Ok(()),
                    Err(e) => match e.errno() {
                        Some(Errno::EBUSY) => Err(expected(e)),
                        // Already gone.
                        Some(Errno::EINVAL | Errno::ENOENT)
                            if !self.is_mounted().map_err(RetryError::Expected)? =>
                        {
                            Ok(())
                        }
                        _ => Err(unexpected(e)),
                    },
                })
                .map_err(|e| {
                    MachinedError::Mount(format!("error unmounting {}: {}", target, e))
                })?;
            debug!(target = %target, "Unmounted");
        }

        for hook in &self.post_unmount_hooks {
            hook(self)?;
        }
        Ok(())
    }

    /// Move the mount to `prefix` + target. The target must be a mount root.
    pub fn move_to(&self, prefix: &str) -> MachinedResult<()> {
        let from = self.target();
        let to = join(prefix, &self.target);
        std::fs::create_dir_all(&to)?;

        mount(
            Some(from.as_str()),
            to.as_str(),
            None::<&str>,
            MsFlags::MS_MOVE,
            None::<&str>,
        )
        .map_err(|e| MachinedError::Mount(format!("failed to move {} to {}: {}", from, to, e)))
    }

    /// Mark the mount shared, recursively.
    pub fn share(&self) -> MachinedResult<()> {
        let target = self.target();
        mount(
            None::<&str>,
            target.as_str(),
            None::<&str>,
            MsFlags::MS_SHARED | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| MachinedError::Mount(format!("failed to share {}: {}", target, e)))
    }

    fn retry<F>(&self, mut f: F) -> MachinedResult<()>
    where
        F: FnMut() -> Result<(), Errno>,
    {
        Retry::constant(timeouts::MOUNT_RETRY, timeouts::MOUNT_RETRY_INTERVAL).retry(|| {
            match f() {
                Ok(()) => Ok(()),
                Err(e @ (Errno::EBUSY | Errno::ENOENT | Errno::ENXIO)) => Err(expected(e)),
                Err(e @ (Errno::EUCLEAN | Errno::EIO)) => {
                    self.repair().map_err(RetryError::Unexpected)?;
                    Err(expected(e))
                }
                Err(Errno::EINVAL) => {
                    if self.is_mounted().map_err(RetryError::Expected)? {
                        Err(unexpected(Errno::EINVAL))
                    } else {
                        self.repair().map_err(RetryError::Unexpected)?;
                        Err(expected(Errno::EINVAL))
                    }
                }
                Err(e) => Err(unexpected(e)),
            }
        })
    }

    fn repair(&self) -> MachinedResult<()> {
        if self.fstype != "xfs" {
            return Ok(());
        }
        info!(source = %self.source, "Repairing XFS filesystem");
        self.runner.run("xfs_repair", &args([self.source.as_str()]))?;
        Ok(())
    }

    /// Grow the partition behind `source` to the end of its disk.
    ///
    /// Returns whether the partition changed.
    fn resize_partition(&self) -> MachinedResult<bool> {
        let sys = Path::new(paths::SYS_CLASS_BLOCK);
        let disk_name = blockdev::partition::parent_device_name(sys, &self.source)
            .ok_or_else(|| {
                MachinedError::InvalidArgument(format!("{} is not a partition", self.source))
            })?;
        let number = blockdev::partition::partition_number(sys, &self.source).ok_or_else(|| {
            MachinedError::InvalidArgument(format!("no partition number for {}", self.source))
        })?;

        let disk = format!("/dev/{}", disk_name);
        let mut device = BlockDevice::open_read_only(&disk)?;
        let table = PartitionTable::read(device.file_mut(), 512)?;
        let entry = table.by_number(number).cloned().ok_or_else(|| {
            MachinedError::NotFound(format!("partition {} on {}", number, disk))
        })?;

        let is_last = table.partitions.iter().all(|p| p.first_lba <= entry.first_lba);
        if !is_last || entry.last_lba >= table.last_usable_lba {
            return Ok(false);
        }

        info!(disk = %disk, partition = number, "Resizing partition to fill disk");
        self.runner.run("sgdisk", &args(["-e", disk.as_str()]))?;
        self.runner.run(
            "sgdisk",
            &args([
                format!("--delete={}", number),
                format!("--new={}:{}:0", number, entry.first_lba),
                format!("--typecode={}:{}", number, entry.type_guid),
                format!("--change-name={}:{}", number, entry.name),
                format!("--partition-guid={}:{}", number, entry.unique_guid),
                disk.clone(),
            ]),
        )?;
        BlockDevice::open_read_only(&disk)?.reread_partitions_with_retry()?;
        Ok(true)
    }

    fn grow_filesystem(&self) -> MachinedResult<()> {
        if self.fstype != "xfs" {
            return Ok(());
        }
        info!(target = %self.target(), "Growing XFS filesystem");
        self.runner.run("xfs_growfs", &args(["-d", self.target().as_str()]))?;
        Ok(())
    }
}

/// Join `target` under `prefix`, treating `target` as relative.
pub fn join(prefix: &str, target: &str) -> String {
    let joined = Path::new(prefix).join(target.trim_start_matches('/'));
    joined.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_dirs() {
        let point = Point::overlay("/etc/kubernetes").with_overlays_root("/var/system/overlays");
        let (upper, work) = point.overlay_dirs();
        assert_eq!(upper, PathBuf::from("/var/system/overlays/etc-kubernetes-diff"));
        assert_eq!(work, PathBuf::from("/var/system/overlays/etc-kubernetes-workdir"));
    }

    #[test]
    fn test_prefix() {
        let mut point = Point::new("proc", "/proc", "proc", MsFlags::empty(), "");
        assert_eq!(point.clone().with_prefix("/root").target(), "/root/proc");
        point.prefix_target("/newroot");
        assert_eq!(point.target(), "/newroot/proc");
        assert_eq!(point.raw_target(), "/newroot/proc");
    }

    #[test]
    fn test_read_only_option_sets_flag() {
        let point = Point::new("/dev/loop0", "/rootfs", "squashfs", MsFlags::empty(), "")
            .with_options(PointFlags::READ_ONLY);
        assert!(point.flags().contains(MsFlags::MS_RDONLY));
    }

    #[test]
    fn test_readonly_overlay_joins_lowers() {
        let point = Point::readonly_overlay(&["/a", "/b"], "/merged");
        assert_eq!(point.source(), "/a:/b");
        assert!(point.options().contains(PointFlags::READONLY_OVERLAY));
    }

    #[test]
    fn test_skip_if_no_filesystem() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), vec![0u8; 4096]).unwrap();
        let target = tempfile::tempdir().unwrap();

        let point = Point::new(
            tmp.path().to_string_lossy(),
            target.path().join("mnt").to_string_lossy(),
            "xfs",
            MsFlags::empty(),
            "",
        )
        .with_options(PointFlags::SKIP_IF_NO_FILESYSTEM);

        assert_eq!(point.mount().unwrap(), MountOutcome::Skipped);
        assert!(!target.path().join("mnt").exists());
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/root", "/proc"), "/root/proc");
        assert_eq!(join("/", "/proc"), "/proc");
    }

    #[test]
    fn test_unmount_not_mounted_runs_hooks() {
        let tmp = tempfile::tempdir().unwrap();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let point = Point::new("none", tmp.path().to_string_lossy(), "tmpfs", MsFlags::empty(), "")
            .with_post_unmount_hook(Arc::new(move |_| {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }));

        point.unmount().unwrap();
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
