//! Execution plans: the phases of every lifecycle sequence.

use super::tasks::*;
use super::types::{LifecycleRequest, ResetOptions, UpgradeOptions};
use crate::pipeline::Pipeline;

// ============================================================================
// EXECUTION PLAN
// ============================================================================

/// Get the execution plan for `request`.
pub fn get_execution_plan(request: &LifecycleRequest) -> Pipeline<Ctx> {
    match request {
        LifecycleRequest::Initialize => initialize(Pipeline::new()),
        LifecycleRequest::Install => install(),
        LifecycleRequest::Boot => boot(),
        LifecycleRequest::Shutdown => shutdown(),
        LifecycleRequest::Upgrade(options) => upgrade(options),
        LifecycleRequest::Reset(options) => reset(options),
    }
}

/// Host requirements shared by every booting sequence.
fn initialize(pipeline: Pipeline<Ctx>) -> Pipeline<Ctx> {
    pipeline
        .phase(
            "system requirements",
            vec![
                Box::new(EnforceKspp),
                Box::new(WriteRequiredSysctls),
                Box::new(SetupSystemDirectory),
                Box::new(MountBpffs),
                Box::new(MountCgroups),
                Box::new(MountPseudoSub),
                Box::new(SetFileLimit),
            ],
        )
        // Needs securityfs from the sub-mounts.
        .phase("integrity", vec![Box::new(WriteImaPolicy)])
        .phase("etc", vec![Box::new(CreateEtcFiles)])
}

fn install() -> Pipeline<Ctx> {
    Pipeline::new()
        .phase("config", vec![Box::new(LoadConfig)])
        .phase("install", vec![Box::new(RunInstaller::install())])
}

fn boot() -> Pipeline<Ctx> {
    initialize(Pipeline::new())
        .phase("discovery network", vec![Box::new(SetupDiscoveryNetwork)])
        .phase(
            "system partitions",
            vec![
                Box::new(DiscoverVolumes),
                Box::new(MountBootPartition),
                Box::new(MountStatePartition),
            ],
        )
        .phase("meta", vec![Box::new(OpenMeta)])
        .phase("config", vec![Box::new(LoadConfig)])
        .phase("network", vec![Box::new(ResetNetwork)])
        // Mutates the process environment; nothing else may run alongside.
        .phase("environment", vec![Box::new(SetUserEnvVars)])
        .phase(
            "stage 1",
            vec![
                Box::new(StartStage1Services),
                Box::new(InitializePlatform),
                Box::new(VerifyInstallation),
            ],
        )
        .phase("ephemeral", vec![Box::new(MountEphemeralPartition)])
        .phase(
            "overlays",
            vec![Box::new(MountOverlays), Box::new(CreateVarDirectories)],
        )
        .phase("shared mounts", vec![Box::new(MountShared)])
        .phase(
            "user config",
            vec![Box::new(SaveConfig), Box::new(MountUserDisks)],
        )
        .phase(
            "user files",
            vec![Box::new(WriteUserFiles), Box::new(WriteUserSysctls)],
        )
        .phase(
            "stage 2",
            vec![Box::new(StartAcpiWatcher), Box::new(StartStage2Services)],
        )
        .phase("label master", vec![Box::new(LabelNodeAsMaster)])
        .phase("update bootloader", vec![Box::new(UpdateBootloader)])
}

/// Unmount everything below the overlays, innermost first.
fn unmount_system(pipeline: Pipeline<Ctx>) -> Pipeline<Ctx> {
    pipeline
        .phase(
            "unmount overlays",
            vec![Box::new(UnmountOverlays), Box::new(UnmountPodMounts)],
        )
        .phase("unmount user disks", vec![Box::new(UnmountUserDisks)])
        .phase("unmount ephemeral", vec![Box::new(UnmountEphemeralPartition)])
        .phase(
            "unmount system partitions",
            vec![
                Box::new(UnmountBootPartition),
                Box::new(UnmountStatePartition),
            ],
        )
        .phase(
            "unmount bind mounts",
            vec![Box::new(UnmountSystemDiskBindMounts)],
        )
}

fn shutdown() -> Pipeline<Ctx> {
    let pipeline = Pipeline::new().phase("stop services", vec![Box::new(StopAllServices)]);
    unmount_system(pipeline)
}

/// Leave the cluster: drain, drop the etcd member, remove pods.
fn leave_cluster(pipeline: Pipeline<Ctx>, preserve: bool) -> Pipeline<Ctx> {
    pipeline
        .phase("cordon and drain", vec![Box::new(CordonAndDrain)])
        .phase("leave etcd", vec![Box::new(LeaveEtcd { preserve })])
        .phase("remove pods", vec![Box::new(RemoveAllPods)])
}

fn upgrade(options: &UpgradeOptions) -> Pipeline<Ctx> {
    let pipeline = leave_cluster(Pipeline::new(), options.preserve)
        .phase("stop services", vec![Box::new(StopServicesForUpgrade)]);

    unmount_system(pipeline)
        .phase("verify disk", vec![Box::new(VerifyDiskFree)])
        .phase(
            "install",
            vec![Box::new(RunInstaller::upgrade(
                options.image.clone(),
                options.pull,
            ))],
        )
        .phase("stop everything", vec![Box::new(StopAllServices)])
}

fn reset(options: &ResetOptions) -> Pipeline<Ctx> {
    let mut pipeline = Pipeline::new();
    if options.graceful {
        pipeline = leave_cluster(pipeline, false);
    }

    pipeline
        .phase("stop services", vec![Box::new(StopAllServices)])
        .phase(
            "unmount overlays",
            vec![Box::new(UnmountOverlays), Box::new(UnmountPodMounts)],
        )
        .phase("unmount user disks", vec![Box::new(UnmountUserDisks)])
        .phase("unmount ephemeral", vec![Box::new(UnmountEphemeralPartition)])
        .phase("reset disk", vec![Box::new(ResetSystemDisk)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Mode;

    fn descriptions(pipeline: &Pipeline<Ctx>) -> Vec<&str> {
        pipeline
            .phases()
            .iter()
            .map(|p| p.description.as_str())
            .collect()
    }

    fn tasks(pipeline: &Pipeline<Ctx>, mode: Mode) -> Vec<&str> {
        pipeline
            .phases()
            .iter()
            .flat_map(|p| p.tasks.iter())
            .filter(|t| t.supports(mode))
            .map(|t| t.name())
            .collect()
    }

    #[test]
    fn test_boot_starts_with_initialize() {
        let init = get_execution_plan(&LifecycleRequest::Initialize);
        let boot = get_execution_plan(&LifecycleRequest::Boot);

        let init_phases = descriptions(&init);
        assert_eq!(&descriptions(&boot)[..init_phases.len()], init_phases.as_slice());
        assert_eq!(
            descriptions(&boot).last().copied(),
            Some("update bootloader")
        );
    }

    #[test]
    fn test_boot_orders_meta_after_discovery() {
        let boot = get_execution_plan(&LifecycleRequest::Boot);
        let phases = descriptions(&boot);
        let position = |name| phases.iter().position(|p| *p == name).unwrap();

        assert!(position("system partitions") < position("meta"));
        assert!(position("meta") < position("config"));
        assert!(position("ephemeral") < position("overlays"));
        assert!(position("overlays") < position("shared mounts"));
    }

    #[test]
    fn test_container_boot_skips_host_tasks() {
        let boot = get_execution_plan(&LifecycleRequest::Boot);

        let container = tasks(&boot, Mode::Container);
        for host_only in [
            "enforce_kspp",
            "mount_cgroups",
            "discover_volumes",
            "open_meta",
            "mount_overlays",
            "verify_installation",
            "update_bootloader",
        ] {
            assert!(!container.contains(&host_only), "{} ran in container", host_only);
        }
        assert!(container.contains(&"load_config"));
        assert!(container.contains(&"start_stage2_services"));

        let metal = tasks(&boot, Mode::Metal);
        assert!(metal.contains(&"verify_installation"));
        // Cloud images are installed by the provider.
        assert!(!tasks(&boot, Mode::Cloud).contains(&"verify_installation"));
    }

    #[test]
    fn test_upgrade_runs_installer_after_unmounts() {
        let upgrade = get_execution_plan(&LifecycleRequest::Upgrade(UpgradeOptions {
            image: Some("installer:v2".to_string()),
            preserve: true,
            pull: true,
        }));
        let names = tasks(&upgrade, Mode::Metal);
        let position = |name| names.iter().position(|n| *n == name).unwrap();

        assert_eq!(names.first().copied(), Some("cordon_and_drain"));
        assert!(position("unmount_ephemeral_partition") < position("verify_disk_free"));
        assert!(position("verify_disk_free") < position("run_installer"));
        assert_eq!(names.last().copied(), Some("stop_all_services"));
    }

    #[test]
    fn test_reset_graceful() {
        let hard = get_execution_plan(&LifecycleRequest::Reset(ResetOptions { graceful: false }));
        let graceful = get_execution_plan(&LifecycleRequest::Reset(ResetOptions { graceful: true }));

        assert!(!tasks(&hard, Mode::Metal).contains(&"cordon_and_drain"));
        assert_eq!(graceful.len(), hard.len() + 3);
        assert_eq!(
            tasks(&graceful, Mode::Metal).last().copied(),
            Some("reset_system_disk")
        );
    }

    #[test]
    fn test_shutdown_unmounts_boot_after_ephemeral() {
        let shutdown = get_execution_plan(&LifecycleRequest::Shutdown);
        let names = tasks(&shutdown, Mode::Metal);
        let position = |name| names.iter().position(|n| *n == name).unwrap();

        assert_eq!(names[0], "stop_all_services");
        assert!(position("unmount_ephemeral_partition") < position("unmount_boot_partition"));
        assert!(position("unmount_boot_partition") < position("unmount_system_disk_bind_mounts"));
    }
}
