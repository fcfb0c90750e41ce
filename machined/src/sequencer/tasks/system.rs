//! Tasks: kernel hardening, system directories, pseudo mounts and `/etc`.

use super::{Ctx, log_task_error};
use crate::constants::{limits, paths, version};
use crate::kspp::{self, SystemProperty};
use crate::mount::manager::{bind_file, mount_all_async};
use crate::mount::sets;
use crate::pipeline::PhaseTask;
use crate::runtime::{Mode, SystemLayout};
use crate::util::blocking;
use async_trait::async_trait;
use machined_shared::{MachinedError, MachinedResult};
use nix::sys::resource::{Resource, setrlimit};
use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// ============================================================================
// KSPP AND SYSCTLS
// ============================================================================

pub struct EnforceKspp;

#[async_trait]
impl PhaseTask<Ctx> for EnforceKspp {
    fn name(&self) -> &str {
        "enforce_kspp"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        kspp::enforce_kernel_parameters(ctx.cmdline())
            .inspect_err(|e| log_task_error(self.name(), e))?;
        let sysctl = ctx.layout().sysctl();
        blocking(move || kspp::enforce_sysctls(&sysctl)).await
    }
}

pub struct WriteRequiredSysctls;

#[async_trait]
impl PhaseTask<Ctx> for WriteRequiredSysctls {
    fn name(&self) -> &str {
        "write_required_sysctls"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let sysctl = ctx.layout().sysctl();
        let properties = kspp::required_sysctls(ctx.mode());
        blocking(move || sysctl.write_all(&properties)).await
    }
}

pub struct WriteUserSysctls;

#[async_trait]
impl PhaseTask<Ctx> for WriteUserSysctls {
    fn name(&self) -> &str {
        "write_user_sysctls"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let config = ctx.config()?;
        let properties: Vec<SystemProperty> = config
            .machine
            .sysctls
            .iter()
            .map(|(k, v)| SystemProperty::new(k, v))
            .collect();
        let sysctl = ctx.layout().sysctl();
        blocking(move || sysctl.write_all(&properties)).await
    }
}

// ============================================================================
// SYSTEM DIRECTORIES AND LIMITS
// ============================================================================

const SYSTEM_DIRECTORIES: &[&str] = &[
    paths::SYSTEM_ETC_PATH,
    paths::SYSTEM_RUN_PATH,
    paths::SYSTEM_VAR_PATH,
    paths::STATE_MOUNT_POINT,
];

pub struct SetupSystemDirectory;

#[async_trait]
impl PhaseTask<Ctx> for SetupSystemDirectory {
    fn name(&self) -> &str {
        "setup_system_directory"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        create_private_dirs(ctx.layout(), SYSTEM_DIRECTORIES)
    }
}

/// Create `dirs` under `layout` with mode 0700.
pub(super) fn create_private_dirs(layout: &SystemLayout, dirs: &[&str]) -> MachinedResult<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true).mode(0o700);
    for dir in dirs {
        builder.create(layout.path(dir))?;
    }
    Ok(())
}

pub struct SetFileLimit;

#[async_trait]
impl PhaseTask<Ctx> for SetFileLimit {
    fn name(&self) -> &str {
        "set_file_limit"
    }

    async fn run(self: Box<Self>, _ctx: Ctx) -> MachinedResult<()> {
        setrlimit(Resource::RLIMIT_NOFILE, limits::NOFILE, limits::NOFILE)?;
        Ok(())
    }
}

// ============================================================================
// PSEUDO FILESYSTEMS
// ============================================================================

pub struct MountBpffs;

#[async_trait]
impl PhaseTask<Ctx> for MountBpffs {
    fn name(&self) -> &str {
        "mount_bpffs"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, _ctx: Ctx) -> MachinedResult<()> {
        mount_all_async(sets::bpffs()?).await
    }
}

pub struct MountCgroups;

#[async_trait]
impl PhaseTask<Ctx> for MountCgroups {
    fn name(&self) -> &str {
        "mount_cgroups"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, _ctx: Ctx) -> MachinedResult<()> {
        mount_all_async(sets::cgroups()?).await
    }
}

pub struct MountPseudoSub;

#[async_trait]
impl PhaseTask<Ctx> for MountPseudoSub {
    fn name(&self) -> &str {
        "mount_pseudo_sub"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, _ctx: Ctx) -> MachinedResult<()> {
        mount_all_async(sets::pseudo_sub()?).await
    }
}

// ============================================================================
// IMA
// ============================================================================

// See Documentation/ABI/testing/ima_policy in the kernel tree.
const IMA_RULES: &[&str] = &[
    "dont_measure fsmagic=0x9fa0",     // PROC_SUPER_MAGIC
    "dont_measure fsmagic=0x62656572", // SYSFS_MAGIC
    "dont_measure fsmagic=0x64626720", // DEBUGFS_MAGIC
    "dont_measure fsmagic=0x1021994",  // TMPFS_MAGIC
    "dont_measure fsmagic=0x1cd1",     // DEVPTS_SUPER_MAGIC
    "dont_measure fsmagic=0x42494e4d", // BINFMTFS_MAGIC
    "dont_measure fsmagic=0x73636673", // SECURITYFS_MAGIC
    "dont_measure fsmagic=0xf97cff8c", // SELINUX_MAGIC
    "dont_measure fsmagic=0x43415d53", // SMACK_MAGIC
    "dont_measure fsmagic=0x27e0eb",   // CGROUP_SUPER_MAGIC
    "dont_measure fsmagic=0x63677270", // CGROUP2_SUPER_MAGIC
    "dont_measure fsmagic=0x6e736673", // NSFS_MAGIC
    "dont_measure fsmagic=0xde5e81e4", // EFIVARFS_MAGIC
    "dont_measure fsmagic=0x58465342", // XFS_MAGIC
    "dont_measure fsmagic=0x794c7630", // OVERLAYFS_SUPER_MAGIC
    "measure func=MMAP_CHECK mask=MAY_EXEC",
    "measure func=BPRM_CHECK mask=MAY_EXEC",
    "measure func=FILE_CHECK mask=^MAY_READ euid=0",
    "measure func=FILE_CHECK mask=^MAY_READ uid=0",
    "measure func=MODULE_CHECK",
    "measure func=FIRMWARE_CHECK",
    "measure func=POLICY_CHECK",
];

pub struct WriteImaPolicy;

#[async_trait]
impl PhaseTask<Ctx> for WriteImaPolicy {
    fn name(&self) -> &str {
        "write_ima_policy"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        write_ima_policy(&ctx.layout().path(paths::IMA_POLICY))
    }
}

/// Append every rule to the policy file, one write per rule.
pub(super) fn write_ima_policy(policy: &Path) -> MachinedResult<()> {
    if !policy.exists() {
        return Err(MachinedError::NotFound(format!(
            "IMA policy file {}",
            policy.display()
        )));
    }

    let mut file = OpenOptions::new().append(true).open(policy)?;
    for rule in IMA_RULES {
        file.write_all(format!("{}\n", rule).as_bytes())
            .map_err(|e| MachinedError::InvalidArgument(format!("IMA rule {:?}: {}", rule, e)))?;
    }
    debug!(rules = IMA_RULES.len(), "Wrote IMA policy");
    Ok(())
}

// ============================================================================
// ETC FILES
// ============================================================================

/// Files under `/etc` backed by writable copies in `/system/etc`.
const ETC_FILES: &[&str] = &["hosts", "resolv.conf", "os-release"];

pub struct CreateEtcFiles;

#[async_trait]
impl PhaseTask<Ctx> for CreateEtcFiles {
    fn name(&self) -> &str {
        "create_etc_files"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let layout = ctx.layout().clone();
        let bindings = prepare_etc_files(&layout)?;
        blocking(move || {
            for (source, target) in &bindings {
                bind_file(source, target, false)?;
            }
            info!(files = ?ETC_FILES, "Created /etc files");
            Ok(())
        })
        .await
    }
}

/// Create the writable `/system/etc` sources and render `os-release`.
/// Returns `(source, target)` bind pairs.
pub(super) fn prepare_etc_files(layout: &SystemLayout) -> MachinedResult<Vec<(PathBuf, PathBuf)>> {
    let system_etc = layout.system_etc();
    std::fs::create_dir_all(&system_etc)?;

    let mut bindings = Vec::with_capacity(ETC_FILES.len());
    for name in ETC_FILES {
        let source = system_etc.join(name);
        if *name == "os-release" {
            std::fs::write(&source, os_release(version::NAME, version::TAG))?;
        } else if !source.exists() {
            std::fs::File::create(&source)?;
        }
        bindings.push((source, layout.path(Path::new("/etc").join(name))));
    }
    Ok(bindings)
}

pub(super) fn os_release(name: &str, version: &str) -> String {
    format!(
        "NAME=\"{name}\"\nID={id}\nVERSION_ID={version}\nPRETTY_NAME=\"{name} ({version})\"\n",
        id = name.to_lowercase(),
    )
}

// ============================================================================
// ENVIRONMENT
// ============================================================================

pub struct SetUserEnvVars;

#[async_trait]
impl PhaseTask<Ctx> for SetUserEnvVars {
    fn name(&self) -> &str {
        "set_user_env_vars"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let config = ctx.config()?;
        for (key, value) in &config.machine.env {
            // SAFETY: runs alone in its phase; nothing else in the process
            // reads the environment concurrently.
            unsafe { std::env::set_var(key, value) };
        }
        debug!(count = config.machine.env.len(), "Set user environment");
        Ok(())
    }
}
