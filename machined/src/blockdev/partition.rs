//! Partition device path derivation.

use machined_shared::{MachinedError, MachinedResult};
use std::path::{Path, PathBuf};

/// Device node of partition `index` on `device`.
///
/// - `nvme*`, `loop*` get a `p<N>` suffix
/// - `sd*`, `hd*`, `vd*`, `xvd*` get `<N>`
/// - `/dev/disk/by-id/*` links are resolved first; other `by-*` paths are rejected
pub fn partition_path(device: &str, index: u32) -> MachinedResult<String> {
    let resolved = resolve_device(device)?;
    let name = Path::new(&resolved)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| MachinedError::InvalidArgument(format!("invalid device path {}", device)))?;

    if name.starts_with("nvme") || name.starts_with("loop") {
        Ok(format!("{}p{}", resolved, index))
    } else if ["sd", "hd", "vd", "xvd"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Ok(format!("{}{}", resolved, index))
    } else {
        Err(MachinedError::Unsupported(format!(
            "cannot derive partition name for {}",
            device
        )))
    }
}

fn resolve_device(device: &str) -> MachinedResult<String> {
    let path = Path::new(device);
    let Some(parent) = path.parent() else {
        return Ok(device.to_string());
    };

    let parent = parent.to_string_lossy();
    if parent == "/dev/disk/by-id" {
        let target = std::fs::read_link(path)?;
        let absolute = if target.is_absolute() {
            target
        } else {
            normalize(&path.parent().unwrap_or(Path::new("/")).join(target))
        };
        return Ok(absolute.to_string_lossy().into_owned());
    }

    if parent.starts_with("/dev/disk/by-") {
        return Err(MachinedError::Unsupported(format!(
            "{} is not supported, use /dev/disk/by-id or a device node",
            device
        )));
    }

    Ok(device.to_string())
}

/// Lexically resolve `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Kernel name of the disk holding partition `partition` (e.g. `sda1` -> `sda`),
/// read from sysfs under `sys_class_block`.
pub fn parent_device_name(sys_class_block: &Path, partition: &str) -> Option<String> {
    let name = Path::new(partition).file_name()?.to_str()?;
    let entry = sys_class_block.join(name);
    if !entry.join("partition").exists() {
        return None;
    }
    let canonical = std::fs::canonicalize(&entry).ok()?;
    canonical
        .parent()?
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

/// Partition number of a partition in sysfs.
pub fn partition_number(sys_class_block: &Path, partition: &str) -> Option<u32> {
    let name = Path::new(partition).file_name()?.to_str()?;
    std::fs::read_to_string(sys_class_block.join(name).join("partition"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn test_partition_path_suffixes() {
        assert_eq!(partition_path("/dev/sda", 1).unwrap(), "/dev/sda1");
        assert_eq!(partition_path("/dev/vdb", 3).unwrap(), "/dev/vdb3");
        assert_eq!(partition_path("/dev/xvda", 2).unwrap(), "/dev/xvda2");
        assert_eq!(partition_path("/dev/hda", 4).unwrap(), "/dev/hda4");
        assert_eq!(partition_path("/dev/nvme0n1", 2).unwrap(), "/dev/nvme0n1p2");
        assert_eq!(partition_path("/dev/loop0", 6).unwrap(), "/dev/loop0p6");
    }

    #[test]
    fn test_partition_path_rejects_other_by_paths() {
        assert!(partition_path("/dev/disk/by-uuid/1234", 1).is_err());
        assert!(partition_path("/dev/disk/by-path/pci-0000", 1).is_err());
    }

    #[test]
    fn test_partition_path_unknown_device() {
        assert!(partition_path("/dev/mapper/root", 1).is_err());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize(Path::new("/dev/disk/by-id/../../sda")),
            PathBuf::from("/dev/sda")
        );
    }

    #[test]
    fn test_parent_device_from_sysfs() {
        let tmp = tempfile::tempdir().unwrap();
        let devices = tmp.path().join("devices/pci/block/sda");
        std::fs::create_dir_all(devices.join("sda1")).unwrap();
        std::fs::write(devices.join("sda1/partition"), "1\n").unwrap();

        let class = tmp.path().join("class/block");
        std::fs::create_dir_all(&class).unwrap();
        symlink(devices.join("sda1"), class.join("sda1")).unwrap();
        symlink(&devices, class.join("sda")).unwrap();

        assert_eq!(
            parent_device_name(&class, "/dev/sda1").as_deref(),
            Some("sda")
        );
        assert_eq!(parent_device_name(&class, "/dev/sda"), None);
        assert_eq!(partition_number(&class, "sda1"), Some(1));
    }
}
