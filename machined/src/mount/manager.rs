//! Whole-set operations: forward mount, reverse unmount, move.

use super::point::MountOutcome;
use super::points::Points;
use crate::util::blocking;
use machined_shared::{MachinedError, MachinedResult};
use nix::mount::{MsFlags, mount};
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{debug, info};

/// Mount every point in insertion order. Stops at the first failure.
pub fn mount_all(points: &Points) -> MachinedResult<()> {
    for (key, point) in points.iter() {
        match point.mount()? {
            MountOutcome::Mounted => debug!(key, target = %point.target(), "Point mounted"),
            MountOutcome::Skipped => debug!(key, target = %point.target(), "Point skipped"),
        }
    }
    Ok(())
}

/// Unmount every point in reverse insertion order. Stops at the first failure.
pub fn unmount_all(points: &Points) -> MachinedResult<()> {
    for (key, point) in points.iter_rev() {
        point.unmount()?;
        debug!(key, target = %point.target(), "Point unmounted");
    }
    Ok(())
}

/// Move every point under `prefix`, in insertion order.
pub fn move_all(points: &Points, prefix: &str) -> MachinedResult<()> {
    for (key, point) in points.iter() {
        point.move_to(prefix)?;
        info!(key, from = %point.target(), prefix, "Moved mount");
    }
    Ok(())
}

/// Bind mount the file `source` over `target`, creating both if missing.
///
/// A read-only bind needs a second remount pass; the kernel ignores
/// `MS_RDONLY` on the initial bind.
pub fn bind_file(source: &Path, target: &Path, read_only: bool) -> MachinedResult<()> {
    for path in [source, target] {
        if path.exists() {
            continue;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)?;
    }

    let bind = |flags: MsFlags| {
        mount(Some(source), target, None::<&str>, flags, None::<&str>).map_err(|e| {
            MachinedError::Mount(format!(
                "failed to bind {} to {}: {}",
                source.display(),
                target.display(),
                e
            ))
        })
    };

    bind(MsFlags::MS_BIND)?;
    if read_only {
        bind(MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY)?;
    }
    debug!(source = %source.display(), target = %target.display(), read_only, "Bound file");
    Ok(())
}

/// [`mount_all`] on the blocking pool.
pub async fn mount_all_async(points: Points) -> MachinedResult<()> {
    blocking(move || mount_all(&points)).await
}

/// [`unmount_all`] on the blocking pool.
pub async fn unmount_all_async(points: Points) -> MachinedResult<()> {
    blocking(move || unmount_all(&points)).await
}
