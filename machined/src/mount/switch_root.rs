//! Pivot from the initramfs into the real root filesystem.

use super::manager::move_all;
use super::points::Points;
use machined_shared::{MachinedError, MachinedResult};
use nix::mount::{MsFlags, mount};
use nix::unistd::{chdir, chroot, execv};
use std::ffi::CString;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::{info, warn};
use walkdir::WalkDir;

const INIT: &str = "/sbin/init";

/// Move `pseudo` under `new_root`, make it `/`, purge the initramfs and
/// exec the real init. Only returns on failure.
pub fn switch_root(new_root: &str, pseudo: &Points) -> MachinedResult<()> {
    move_all(pseudo, new_root)?;

    chdir(new_root)?;

    let old_root = File::open("/")?;
    let old_dev = old_root.metadata()?.dev();

    mount(
        Some(new_root),
        "/",
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .map_err(|e| MachinedError::Mount(format!("failed to move {} to /: {}", new_root, e)))?;

    chroot(".")?;
    chdir("/")?;

    info!("Removing initramfs contents");
    let old_root_path = format!("/proc/self/fd/{}", old_root.as_raw_fd());
    if let Err(e) = recursive_delete(Path::new(&old_root_path), old_dev) {
        warn!(error = %e, "Failed to purge initramfs");
    }
    drop(old_root);

    let init = CString::new(INIT).map_err(|e| MachinedError::Internal(e.to_string()))?;
    let Err(errno) = execv(&init, &[init.clone()]);
    Err(MachinedError::Internal(format!("exec {} failed: {}", INIT, errno)))
}

/// Delete everything below `root` that lives on device `dev`.
///
/// Entries on other devices (mount points) are skipped along with their
/// subtrees; `root` itself is kept.
pub fn recursive_delete(root: &Path, dev: u64) -> MachinedResult<()> {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .same_file_system(true);

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        let metadata = entry.path().symlink_metadata()?;
        if metadata.dev() != dev {
            continue;
        }

        let result = if entry.file_type().is_dir() {
            std::fs::remove_dir(entry.path())
        } else {
            std::fs::remove_file(entry.path())
        };

        if let Err(e) = result {
            warn!(path = %entry.path().display(), error = %e, "Failed to remove");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recursive_delete_keeps_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("a/b/c")).unwrap();
        std::fs::write(root.join("a/b/c/file"), "x").unwrap();
        std::fs::write(root.join("top"), "y").unwrap();
        std::os::unix::fs::symlink("/etc/hostname", root.join("link")).unwrap();

        let dev = std::fs::metadata(root).unwrap().dev();
        recursive_delete(root, dev).unwrap();

        assert!(root.exists());
        assert_eq!(std::fs::read_dir(root).unwrap().count(), 0);
    }

    #[test]
    fn test_recursive_delete_skips_foreign_device() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("file"), "x").unwrap();

        recursive_delete(tmp.path(), u64::MAX).unwrap();
        assert!(tmp.path().join("file").exists());
    }
}
