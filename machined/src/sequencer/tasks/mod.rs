//! Lifecycle tasks. One struct per task; each runs against the shared
//! [`Runtime`].

mod bootloader;
mod cluster;
mod config;
mod disk;
mod services;
mod system;

pub use bootloader::{RunInstaller, UpdateBootloader, VerifyInstallation};
pub use cluster::{CordonAndDrain, LabelNodeAsMaster, LeaveEtcd, RemoveAllPods};
pub use config::{LoadConfig, SaveConfig, WriteUserFiles};
pub use disk::{
    CreateVarDirectories, DiscoverVolumes, MountBootPartition, MountEphemeralPartition,
    MountOverlays, MountShared, MountStatePartition, MountUserDisks, OpenMeta, ResetSystemDisk,
    UnmountBootPartition, UnmountEphemeralPartition, UnmountOverlays, UnmountPodMounts,
    UnmountStatePartition, UnmountSystemDiskBindMounts, UnmountUserDisks, VerifyDiskFree,
};
pub use services::{
    InitializePlatform, ResetNetwork, SetupDiscoveryNetwork, StartAcpiWatcher, StartStage1Services,
    StartStage2Services, StopAllServices, StopServicesForUpgrade,
};
pub use system::{
    CreateEtcFiles, EnforceKspp, MountBpffs, MountCgroups, MountPseudoSub, SetFileLimit,
    SetUserEnvVars, SetupSystemDirectory, WriteImaPolicy, WriteRequiredSysctls, WriteUserSysctls,
};

use crate::mount::manager::mount_all_async;
use crate::mount::points::Points;
use crate::runtime::Runtime;
use machined_shared::{MachinedError, MachinedResult};

pub type Ctx = Runtime;

fn log_task_error(task: &str, e: &MachinedError) {
    tracing::error!(task, error = %e, "Task failed");
}

/// Mount `points` and register them as owned so they unmount on shutdown.
async fn mount_owned(runtime: &Runtime, points: Points) -> MachinedResult<()> {
    let registered = points.clone();
    mount_all_async(points).await?;
    runtime.register_system_points(registered)
}

/// Unmount and forget the owned point under `key`. Missing keys are fine.
async fn unmount_owned(runtime: &Runtime, key: &str) -> MachinedResult<()> {
    let Some(point) = runtime.take_system_point(key) else {
        tracing::debug!(key, "Not mounted by us, skipping");
        return Ok(());
    };
    crate::util::blocking(move || point.unmount()).await
}
