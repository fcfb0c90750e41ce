//! Predefined mount point sets.

use super::point::{Point, PointFlags};
use super::points::Points;
use super::table::{self, MountEntry};
use crate::constants::paths;
use machined_shared::MachinedResult;
use nix::mount::MsFlags;

/// `/dev`, `/proc`, `/sys`, `/run`, `/system`, `/tmp`.
pub fn pseudo() -> MachinedResult<Points> {
    let mut points = Points::new();
    points.set(
        "dev",
        Point::new("devtmpfs", "/dev", "devtmpfs", MsFlags::MS_NOSUID, "mode=0755"),
    )?;
    points.set(
        "proc",
        Point::new(
            "proc",
            "/proc",
            "proc",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            "",
        ),
    )?;
    points.set("sys", Point::new("sysfs", "/sys", "sysfs", MsFlags::empty(), ""))?;
    points.set(
        "run",
        Point::new(
            "tmpfs",
            "/run",
            "tmpfs",
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            "mode=0755",
        ),
    )?;
    points.set(
        "system",
        Point::new("tmpfs", "/system", "tmpfs", MsFlags::empty(), "mode=0755"),
    )?;
    points.set(
        "tmp",
        Point::new("tmpfs", "/tmp", "tmpfs", MsFlags::empty(), "size=64M"),
    )?;
    Ok(points)
}

/// Mounts nested inside the pseudo filesystems.
pub fn pseudo_sub() -> MachinedResult<Points> {
    let mut points = Points::new();
    points.set(
        "devshm",
        Point::new(
            "tmpfs",
            "/dev/shm",
            "tmpfs",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_RELATIME,
            "",
        ),
    )?;
    points.set(
        "devpts",
        Point::new(
            "devpts",
            "/dev/pts",
            "devpts",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            "ptmxmode=000,mode=620,gid=5",
        ),
    )?;
    points.set(
        "securityfs",
        Point::new(
            "securityfs",
            "/sys/kernel/security",
            "securityfs",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_RELATIME,
            "",
        ),
    )?;
    points.set(
        "tracefs",
        Point::new(
            "tracefs",
            "/sys/kernel/tracing",
            "tracefs",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            "",
        ),
    )?;
    points.set(
        "efivars",
        Point::new(
            "efivarfs",
            "/sys/firmware/efi/efivars",
            "efivarfs",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_RELATIME,
            "",
        )
        .with_options(PointFlags::SKIP_IF_NO_DEVICE),
    )?;
    Ok(points)
}

/// Unified cgroup hierarchy.
pub fn cgroups() -> MachinedResult<Points> {
    let mut points = Points::new();
    points.set(
        "cgroup2",
        Point::new(
            "cgroup",
            "/sys/fs/cgroup",
            "cgroup2",
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME,
            "nsdelegate,memory_recursiveprot",
        ),
    )?;
    Ok(points)
}

/// BPF filesystem, shared so pods see pinned programs.
pub fn bpffs() -> MachinedResult<Points> {
    let mut points = Points::new();
    points.set(
        "bpf",
        Point::new(
            "bpffs",
            "/sys/fs/bpf",
            "bpf",
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME,
            "",
        )
        .with_options(PointFlags::SHARED),
    )?;
    Ok(points)
}

/// Writable overlays over read-only rootfs directories.
pub const OVERLAY_TARGETS: &[&str] = &[
    "/etc/kubernetes",
    "/etc/cni",
    "/usr/libexec/kubernetes",
    "/opt",
];

pub fn overlays() -> MachinedResult<Points> {
    let mut points = Points::new();
    for target in OVERLAY_TARGETS {
        points.set(*target, Point::overlay(*target))?;
    }
    Ok(points)
}

/// Boot partition at `/boot`.
pub fn boot(device: &str, fstype: &str) -> MachinedResult<Points> {
    let mut points = Points::new();
    points.set(
        "boot",
        Point::new(device, paths::BOOT_MOUNT_POINT, fstype, MsFlags::empty(), "")
            .with_options(PointFlags::SKIP_IF_NO_FILESYSTEM),
    )?;
    Ok(points)
}

/// State partition holding the persisted machine config.
pub fn state(device: &str) -> MachinedResult<Points> {
    let mut points = Points::new();
    points.set(
        "state",
        Point::new(device, paths::STATE_MOUNT_POINT, "xfs", MsFlags::empty(), "")
            .with_options(PointFlags::SKIP_IF_NO_FILESYSTEM),
    )?;
    Ok(points)
}

/// Ephemeral partition at `/var`, grown to fill its disk.
pub fn ephemeral(device: &str) -> MachinedResult<Points> {
    let mut points = Points::new();
    points.set(
        "ephemeral",
        Point::new(
            device,
            paths::EPHEMERAL_MOUNT_POINT,
            "xfs",
            MsFlags::empty(),
            "",
        )
        .with_options(PointFlags::RESIZE | PointFlags::SKIP_IF_NO_FILESYSTEM),
    )?;
    Ok(points)
}

/// Squashfs rootfs on `loop_device`, mounted read-only at `prefix`.
pub fn squashfs(prefix: &str, loop_device: &str) -> MachinedResult<Points> {
    let mut points = Points::new();
    points.set(
        "squashfs",
        Point::new(loop_device, prefix, "squashfs", MsFlags::empty(), "")
            .with_options(PointFlags::READ_ONLY),
    )?;
    Ok(points)
}

fn from_entries<'a>(entries: impl Iterator<Item = &'a MountEntry>) -> MachinedResult<Points> {
    let mut points = Points::new();
    for entry in entries {
        points.set(
            entry.target.clone(),
            Point::new(
                entry.source.clone(),
                entry.target.clone(),
                entry.fstype.clone(),
                MsFlags::empty(),
                "",
            ),
        )?;
    }
    Ok(points)
}

/// Every mount below the kubelet pods directory.
pub fn pod_mounts(entries: &[MountEntry]) -> MachinedResult<Points> {
    let prefix = format!("{}/", paths::KUBELET_PODS);
    from_entries(entries.iter().filter(|e| e.target.starts_with(&prefix)))
}

/// Mounts backed by a partition of `disk` that are not in `owned`.
pub fn system_disk_bind_mounts(
    entries: &[MountEntry],
    disk: &str,
    owned: &[String],
) -> MachinedResult<Points> {
    from_entries(entries.iter().filter(|e| {
        e.source.starts_with(disk) && e.source != disk && !owned.contains(&e.target)
    }))
}

/// Current mount table snapshot for the dynamic sets.
pub fn current_mounts() -> MachinedResult<Vec<MountEntry>> {
    table::read()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_sets_build() {
        assert_eq!(pseudo().unwrap().len(), 6);
        assert_eq!(pseudo_sub().unwrap().len(), 5);
        assert_eq!(cgroups().unwrap().len(), 1);
        assert!(
            bpffs()
                .unwrap()
                .get("bpf")
                .unwrap()
                .options()
                .contains(PointFlags::SHARED)
        );
        assert_eq!(overlays().unwrap().len(), OVERLAY_TARGETS.len());
    }

    #[test]
    fn test_pseudo_order() {
        let points = pseudo().unwrap();
        let keys: Vec<&str> = points.keys().collect();
        assert_eq!(keys, vec!["dev", "proc", "sys", "run", "system", "tmp"]);
    }

    #[test]
    fn test_dynamic_sets() {
        let entries = table::parse(
            "/dev/sda6 /var xfs rw 0 0\n\
             /dev/sda6 /etc/kubernetes xfs rw 0 0\n\
             tmpfs /var/lib/kubelet/pods/abc/volumes/x tmpfs rw 0 0\n\
             /dev/sdb1 /mnt xfs rw 0 0\n",
        );

        let pods = pod_mounts(&entries).unwrap();
        assert_eq!(pods.len(), 1);

        let binds =
            system_disk_bind_mounts(&entries, "/dev/sda", &["/var".to_string()]).unwrap();
        let keys: Vec<&str> = binds.keys().collect();
        assert_eq!(keys, vec!["/etc/kubernetes"]);
    }

    #[test]
    fn test_ephemeral_resizes() {
        let points = ephemeral("/dev/sda6").unwrap();
        let point = points.get("ephemeral").unwrap();
        assert!(point.options().contains(PointFlags::RESIZE));
        assert_eq!(point.target(), "/var");
    }
}
