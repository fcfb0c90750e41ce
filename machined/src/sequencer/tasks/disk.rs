//! Tasks: volume discovery, META, system partitions and user disks.

use super::system::create_private_dirs;
use super::{Ctx, mount_owned, unmount_owned};
use crate::blockdev::partition::parent_device_name;
use crate::blockdev::{BlockDevice, PartitionTable};
use crate::config::DiskConfig;
use crate::constants::{labels, paths};
use crate::installer::{DiskOps, Manifest, reset_device, verify_disk_free};
use crate::meta::Meta;
use crate::mount::manager::{mount_all_async, unmount_all_async};
use crate::mount::{Point, Points, safe_unmount, sets};
use crate::pipeline::PhaseTask;
use crate::resources::{META_VOLUME_ID, VolumePhase, VolumeStatus};
use crate::runtime::Mode;
use crate::util::blocking;
use crate::util::process::CommandRunner;
use async_trait::async_trait;
use machined_shared::{MachinedError, MachinedResult};
use nix::mount::MsFlags;
use std::path::Path;
use tracing::{debug, info, warn};

/// Key prefix of user disk mounts in the owned set.
const USER_DISK_KEY: &str = "user:";

const SHARED_MOUNTS: &[&str] = &["/", "/var/lib/kubelet", "/etc/cni", "/run"];

const VAR_DIRECTORIES: &[&str] = &["/var/log/pods", "/var/lib/kubelet", "/var/run/lock"];

// ============================================================================
// VOLUMES AND META
// ============================================================================

/// Publishes the META volume status for [`OpenMeta`] to wait on.
pub struct DiscoverVolumes;

#[async_trait]
impl PhaseTask<Ctx> for DiscoverVolumes {
    fn name(&self) -> &str {
        "discover_volumes"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let disks = ctx.disks().clone();
        let status = blocking(move || {
            meta_volume_status(disks.as_ref(), Path::new(paths::SYS_CLASS_BLOCK))
        })
        .await?;
        info!(phase = ?status.phase, location = %status.location, "META volume discovered");
        ctx.state().volumes.put(status);
        Ok(())
    }
}

fn meta_volume_status(disks: &dyn DiskOps, sys_class_block: &Path) -> MachinedResult<VolumeStatus> {
    let status = match disks.find_by_label(labels::META)? {
        Some(location) => {
            let parent_location = parent_device_name(sys_class_block, &location)
                .map(|name| format!("/dev/{}", name))
                .unwrap_or_default();
            VolumeStatus {
                id: META_VOLUME_ID.to_string(),
                phase: VolumePhase::Ready,
                location,
                parent_location,
            }
        }
        None => VolumeStatus {
            id: META_VOLUME_ID.to_string(),
            phase: VolumePhase::Missing,
            location: String::new(),
            parent_location: String::new(),
        },
    };
    Ok(status)
}

pub struct OpenMeta;

#[async_trait]
impl PhaseTask<Ctx> for OpenMeta {
    fn name(&self) -> &str {
        "open_meta"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        match Meta::open(ctx.state().clone()).await {
            Ok(meta) => {
                ctx.set_meta(meta);
                Ok(())
            }
            Err(MachinedError::NoMetaPartition) => {
                info!("No META partition, continuing without it");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// SYSTEM PARTITIONS
// ============================================================================

/// Mount the partition labeled `label` as an owned set. Absent partitions
/// are skipped.
async fn mount_labeled(
    ctx: &Ctx,
    label: &'static str,
    build: fn(&str) -> MachinedResult<Points>,
) -> MachinedResult<()> {
    let disks = ctx.disks().clone();
    let Some(device) = blocking(move || disks.find_by_label(label)).await? else {
        info!(label, "Partition not found, skipping mount");
        return Ok(());
    };
    mount_owned(ctx, build(&device)?).await
}

pub struct MountBootPartition;

#[async_trait]
impl PhaseTask<Ctx> for MountBootPartition {
    fn name(&self) -> &str {
        "mount_boot_partition"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        mount_labeled(&ctx, labels::BOOT, |device| sets::boot(device, "xfs")).await
    }
}

pub struct MountStatePartition;

#[async_trait]
impl PhaseTask<Ctx> for MountStatePartition {
    fn name(&self) -> &str {
        "mount_state_partition"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        mount_labeled(&ctx, labels::STATE, sets::state).await
    }
}

pub struct MountEphemeralPartition;

#[async_trait]
impl PhaseTask<Ctx> for MountEphemeralPartition {
    fn name(&self) -> &str {
        "mount_ephemeral_partition"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        mount_labeled(&ctx, labels::EPHEMERAL, sets::ephemeral).await
    }
}

pub struct UnmountBootPartition;

#[async_trait]
impl PhaseTask<Ctx> for UnmountBootPartition {
    fn name(&self) -> &str {
        "unmount_boot_partition"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        unmount_owned(&ctx, "boot").await
    }
}

pub struct UnmountStatePartition;

#[async_trait]
impl PhaseTask<Ctx> for UnmountStatePartition {
    fn name(&self) -> &str {
        "unmount_state_partition"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        unmount_owned(&ctx, "state").await
    }
}

pub struct UnmountEphemeralPartition;

#[async_trait]
impl PhaseTask<Ctx> for UnmountEphemeralPartition {
    fn name(&self) -> &str {
        "unmount_ephemeral_partition"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        unmount_owned(&ctx, "ephemeral").await
    }
}

// ============================================================================
// OVERLAYS AND SHARED MOUNTS
// ============================================================================

pub struct MountOverlays;

#[async_trait]
impl PhaseTask<Ctx> for MountOverlays {
    fn name(&self) -> &str {
        "mount_overlays"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, _ctx: Ctx) -> MachinedResult<()> {
        mount_all_async(sets::overlays()?).await
    }
}

pub struct UnmountOverlays;

#[async_trait]
impl PhaseTask<Ctx> for UnmountOverlays {
    fn name(&self) -> &str {
        "unmount_overlays"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, _ctx: Ctx) -> MachinedResult<()> {
        unmount_all_async(sets::overlays()?).await
    }
}

/// Marks the container runtime's mount trees as shared.
pub struct MountShared;

#[async_trait]
impl PhaseTask<Ctx> for MountShared {
    fn name(&self) -> &str {
        "mount_shared"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, _ctx: Ctx) -> MachinedResult<()> {
        blocking(|| {
            for target in SHARED_MOUNTS {
                Point::new("", *target, "", MsFlags::empty(), "").share()?;
            }
            Ok(())
        })
        .await
    }
}

pub struct CreateVarDirectories;

#[async_trait]
impl PhaseTask<Ctx> for CreateVarDirectories {
    fn name(&self) -> &str {
        "create_var_directories"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        create_private_dirs(ctx.layout(), VAR_DIRECTORIES)
    }
}

// ============================================================================
// USER DISKS
// ============================================================================

/// Partitions and mounts the extra disks listed in the machine config.
pub struct MountUserDisks;

#[async_trait]
impl PhaseTask<Ctx> for MountUserDisks {
    fn name(&self) -> &str {
        "mount_user_disks"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let configs = ctx.config()?.machine.disks;
        if configs.is_empty() {
            return Ok(());
        }

        let disks = ctx.disks().clone();
        let commands = ctx.commands().clone();
        let points = blocking(move || {
            partition_user_disks(&configs, disks.as_ref(), commands.as_ref(), has_partitions)?;
            user_disk_points(&configs, disks.as_ref())
        })
        .await?;

        mount_owned(&ctx, points).await
    }
}

fn has_partitions(disk: &str) -> bool {
    BlockDevice::open_read_only(disk)
        .and_then(|mut device| PartitionTable::read(device.file_mut(), 512))
        .is_ok_and(|table| !table.partitions.is_empty())
}

/// Partition and format every configured disk that carries no partitions yet.
fn partition_user_disks(
    configs: &[DiskConfig],
    disks: &dyn DiskOps,
    runner: &dyn CommandRunner,
    is_partitioned: impl Fn(&str) -> bool,
) -> MachinedResult<()> {
    let pending: Vec<DiskConfig> = configs
        .iter()
        .filter(|config| {
            let partitioned = is_partitioned(&config.device);
            if partitioned {
                debug!(disk = %config.device, "Disk already partitioned");
            }
            !partitioned
        })
        .cloned()
        .collect();

    if pending.is_empty() {
        return Ok(());
    }

    let mut manifest = Manifest::user_disks(&pending);
    manifest.validate(disks)?;
    manifest.execute(runner, disks)
}

/// Mount points for user partitions, keyed `user:<mountpoint>`.
fn user_disk_points(configs: &[DiskConfig], disks: &dyn DiskOps) -> MachinedResult<Points> {
    let mut points = Points::new();
    for config in configs {
        for (i, partition) in config.partitions.iter().enumerate() {
            let device = disks.partition_path(&config.device, (i + 1) as u32)?;
            points.set(
                format!("{}{}", USER_DISK_KEY, partition.mountpoint),
                Point::new(
                    device,
                    partition.mountpoint.clone(),
                    "xfs",
                    MsFlags::empty(),
                    "",
                ),
            )?;
        }
    }
    Ok(points)
}

pub struct UnmountUserDisks;

#[async_trait]
impl PhaseTask<Ctx> for UnmountUserDisks {
    fn name(&self) -> &str {
        "unmount_user_disks"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let Some(config) = ctx.try_config() else {
            return Ok(());
        };

        let keys: Vec<String> = config
            .machine
            .disks
            .iter()
            .flat_map(|disk| disk.partitions.iter())
            .map(|partition| format!("{}{}", USER_DISK_KEY, partition.mountpoint))
            .collect();

        for key in keys.iter().rev() {
            unmount_owned(&ctx, key).await?;
        }
        Ok(())
    }
}

// ============================================================================
// TEARDOWN
// ============================================================================

async fn safe_unmount_all(points: Points) -> MachinedResult<()> {
    blocking(move || {
        for (_, point) in points.iter_rev() {
            safe_unmount(point.target())?;
        }
        Ok(())
    })
    .await
}

pub struct UnmountPodMounts;

#[async_trait]
impl PhaseTask<Ctx> for UnmountPodMounts {
    fn name(&self) -> &str {
        "unmount_pod_mounts"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, _ctx: Ctx) -> MachinedResult<()> {
        let entries = blocking(sets::current_mounts).await?;
        let points = sets::pod_mounts(&entries)?;
        debug!(count = points.len(), "Unmounting pod mounts");
        safe_unmount_all(points).await
    }
}

/// Unmounts whatever else still holds a partition of the system disk.
pub struct UnmountSystemDiskBindMounts;

#[async_trait]
impl PhaseTask<Ctx> for UnmountSystemDiskBindMounts {
    fn name(&self) -> &str {
        "unmount_system_disk_bind_mounts"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let Some(disk) = ctx.system_disk() else {
            debug!("No system disk configured");
            return Ok(());
        };

        let entries = blocking(sets::current_mounts).await?;
        let points = sets::system_disk_bind_mounts(&entries, &disk, &ctx.owned_targets())?;
        if !points.is_empty() {
            info!(disk = %disk, count = points.len(), "Unmounting system disk bind mounts");
        }
        safe_unmount_all(points).await
    }
}

/// Fails unless nothing else holds the ephemeral partition open.
pub struct VerifyDiskFree;

#[async_trait]
impl PhaseTask<Ctx> for VerifyDiskFree {
    fn name(&self) -> &str {
        "verify_disk_free"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let disks = ctx.disks().clone();
        blocking(move || match disks.find_by_label(labels::EPHEMERAL)? {
            Some(partition) => verify_disk_free(partition),
            None => {
                warn!("No ephemeral partition to verify");
                Ok(())
            }
        })
        .await
    }
}

pub struct ResetSystemDisk;

#[async_trait]
impl PhaseTask<Ctx> for ResetSystemDisk {
    fn name(&self) -> &str {
        "reset_system_disk"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let disk = ctx.system_disk().ok_or_else(|| {
            MachinedError::Precondition("no install disk configured".to_string())
        })?;
        info!(disk = %disk, "Resetting system disk");
        blocking(move || reset_device(disk)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskPartition;
    use crate::installer::disk::fake::FakeDisks;
    use crate::util::process::RecordingRunner;

    fn disk(device: &str, mountpoints: &[&str]) -> DiskConfig {
        DiskConfig {
            device: device.to_string(),
            partitions: mountpoints
                .iter()
                .map(|m| DiskPartition {
                    mountpoint: m.to_string(),
                    size: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_meta_volume_ready_with_parent() {
        let sys = tempfile::tempdir().unwrap();
        let disk_dir = sys.path().join("devices/vda");
        std::fs::create_dir_all(disk_dir.join("vda4")).unwrap();
        std::fs::write(disk_dir.join("vda4/partition"), "4\n").unwrap();
        std::os::unix::fs::symlink(disk_dir.join("vda4"), sys.path().join("vda4")).unwrap();

        let disks = FakeDisks::default().label(labels::META, "/dev/vda4");
        let status = meta_volume_status(&disks, sys.path()).unwrap();

        assert_eq!(status.phase, VolumePhase::Ready);
        assert_eq!(status.location, "/dev/vda4");
        assert_eq!(status.parent_location, "/dev/vda");
    }

    #[test]
    fn test_meta_volume_missing() {
        let sys = tempfile::tempdir().unwrap();
        let status = meta_volume_status(&FakeDisks::default(), sys.path()).unwrap();
        assert_eq!(status.phase, VolumePhase::Missing);
        assert!(status.location.is_empty());
    }

    #[test]
    fn test_user_disk_points() {
        let disks = FakeDisks::default();
        let points = user_disk_points(
            &[disk("/dev/vdb", &["/var/data", "/var/logs"])],
            &disks,
        )
        .unwrap();

        let keys: Vec<&str> = points.keys().collect();
        assert_eq!(keys, vec!["user:/var/data", "user:/var/logs"]);
        assert_eq!(points.get("user:/var/logs").unwrap().source(), "/dev/vdb2");
    }

    #[test]
    fn test_partitioned_disks_are_left_alone() {
        let disks = FakeDisks::with_disk("/dev/vdb", 8 << 30);
        let runner = RecordingRunner::default();

        partition_user_disks(&[disk("/dev/vdb", &["/var/data"])], &disks, &runner, |_| true)
            .unwrap();
        assert!(runner.calls.lock().is_empty());

        partition_user_disks(&[disk("/dev/vdb", &["/var/data"])], &disks, &runner, |_| false)
            .unwrap();
        let calls = runner.calls.lock();
        assert!(calls.iter().any(|(program, _)| program == "sgdisk"));
        assert_eq!(disks.rereads.lock().as_slice(), ["/dev/vdb".to_string()]);
    }
}
