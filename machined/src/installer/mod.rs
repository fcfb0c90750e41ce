//! Installer and A/B bootloader management.
//!
//! A fresh install partitions the system disk, places the kernel and
//! initramfs under `/boot/A/` and installs syslinux with `DEFAULT A`. An
//! upgrade leaves the partition table alone, writes the new assets under the
//! other label, makes it the default and records it in the `ldlinux.sys` ADV
//! as the upgrade label. The first successful boot clears that tag.

pub mod disk;
pub mod manifest;
pub mod preflight;
pub mod syslinux;

pub use disk::{DiskOps, HostDisks, reset_device, verify_disk_free};
pub use manifest::{Filesystem, Manifest, Target};
pub use syslinux::{BootEntry, BootLabel, Syslinux, SyslinuxConfig};

use crate::cmdline::Cmdline;
use crate::config::InstallConfig;
use crate::constants::{assets, cmdline as keys, labels, paths};
use crate::runtime::Sequence;
use crate::util::process::{CommandRunner, SystemCommandRunner};
use machined_shared::{MachinedError, MachinedResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Bytes of `gptmbr.bin` that fit in front of the partition table.
const MBR_BOOT_CODE_LEN: usize = 440;

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub platform: String,
    /// Written as `talos.config=` on the generated command line.
    pub config_source: Option<String>,
    pub platform_args: Vec<String>,
    /// Directory holding the kernel and initramfs to install.
    pub asset_dir: PathBuf,
    /// Where the boot partition gets mounted.
    pub boot_root: PathBuf,
    pub gptmbr: PathBuf,
    pub efi_dir: PathBuf,
    /// Command line of the running system, reused for the fallback entry.
    pub proc_cmdline: PathBuf,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            platform: "metal".to_string(),
            config_source: None,
            platform_args: Vec::new(),
            asset_dir: PathBuf::from("/usr/install"),
            boot_root: PathBuf::from(paths::BOOT_MOUNT_POINT),
            gptmbr: PathBuf::from(assets::GPTMBR),
            efi_dir: PathBuf::from(assets::SYSLINUX_EFI_DIR),
            proc_cmdline: PathBuf::from(paths::PROC_CMDLINE),
        }
    }
}

/// Outcome of an install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub label: BootLabel,
    pub upgraded: bool,
}

pub struct Installer {
    runner: Arc<dyn CommandRunner>,
    disks: Arc<dyn DiskOps>,
    options: InstallOptions,
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("options", &self.options)
            .finish()
    }
}

impl Installer {
    pub fn new(options: InstallOptions) -> Self {
        Self::with_backends(
            options,
            Arc::new(SystemCommandRunner),
            Arc::new(HostDisks::default()),
        )
    }

    pub fn with_backends(
        options: InstallOptions,
        runner: Arc<dyn CommandRunner>,
        disks: Arc<dyn DiskOps>,
    ) -> Self {
        Self {
            runner,
            disks,
            options,
        }
    }

    pub fn options(&self) -> &InstallOptions {
        &self.options
    }

    /// Install onto `config.disk`. `Sequence::Upgrade` keeps an existing
    /// installation and switches it to the other boot label.
    pub fn install(&self, config: &InstallConfig, sequence: Sequence) -> MachinedResult<InstallReport> {
        let disk = config
            .disk
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| MachinedError::Precondition("install disk is not set".to_string()))?;

        let boot_partition = self.disks.find_by_label(labels::BOOT)?;
        let upgrading = sequence == Sequence::Upgrade && boot_partition.is_some();

        let mut mounted = Vec::new();
        let result = self.run(config, disk, boot_partition.as_deref(), upgrading, &mut mounted);

        for target in mounted.iter().rev() {
            if let Err(e) = self.disks.unmount(target) {
                warn!(target = %target.display(), error = %e, "Failed to unmount after install");
            }
        }
        result
    }

    fn run(
        &self,
        config: &InstallConfig,
        disk: &str,
        boot_partition: Option<&str>,
        upgrading: bool,
        mounted: &mut Vec<PathBuf>,
    ) -> MachinedResult<InstallReport> {
        let boot_root = self.options.boot_root.clone();
        let syslinux = Syslinux::new(&boot_root);

        let mut current = None;
        let label = match boot_partition {
            Some(partition) if upgrading => {
                self.disks.mount(partition, &boot_root, Filesystem::Xfs.fstype())?;
                mounted.push(boot_root.clone());
                let (cur, next) = syslinux.labels()?;
                current = cur;
                next
            }
            _ => BootLabel::A,
        };
        info!(disk, label = %label, upgrading, "Installing");

        let mut manifest = if upgrading {
            Manifest::upgrade(disk, config, label, &self.options.asset_dir)
        } else {
            Manifest::system_disk(disk, config, label, &self.options.asset_dir)
        };
        manifest.validate(self.disks.as_ref())?;

        if !upgrading {
            if config.zero {
                for device in manifest.targets.keys() {
                    self.disks.zero(device)?;
                }
            }
            manifest.execute(self.runner.as_ref(), self.disks.as_ref())?;
            self.mount_boot(&manifest, mounted)?;
        } else if config.force || config.wipe {
            manifest.reformat(self.runner.as_ref(), self.disks.as_ref())?;
        }

        for target in manifest.targets() {
            if target.is_ephemeral() {
                continue;
            }
            if target.is_boot() {
                self.write_gptmbr(&target.device)?;
                target.save(&boot_root)?;
            }
        }

        if config.bootloader {
            self.install_bootloader(&syslinux, config, label, current, upgrading)?;
        }

        info!(label = %label, "Installation complete");
        Ok(InstallReport {
            label,
            upgraded: upgrading,
        })
    }

    fn mount_boot(&self, manifest: &Manifest, mounted: &mut Vec<PathBuf>) -> MachinedResult<()> {
        let root = &self.options.boot_root;
        for (label, target_dir) in [(labels::BOOT, root.clone()), (labels::EFI, root.join("EFI"))] {
            let Some(target) = manifest.target(label) else {
                continue;
            };
            let partition = target.partition.as_deref().ok_or_else(|| {
                MachinedError::Internal(format!("partition {} was not created", label))
            })?;
            self.disks.mount(partition, &target_dir, target.filesystem.fstype())?;
            mounted.push(target_dir);
        }
        Ok(())
    }

    fn write_gptmbr(&self, disk: &str) -> MachinedResult<()> {
        let mut code = std::fs::read(&self.options.gptmbr).map_err(|e| {
            MachinedError::NotFound(format!("{}: {}", self.options.gptmbr.display(), e))
        })?;
        code.truncate(MBR_BOOT_CODE_LEN);
        self.disks.write_at(disk, 0, &code)
    }

    /// Kernel command line of a new boot entry for `label`.
    pub fn kernel_args(&self, config: &InstallConfig, label: BootLabel) -> Cmdline {
        let mut cmdline = Cmdline::default();
        cmdline.append(keys::PLATFORM, Some(self.options.platform.as_str()));
        if let Some(source) = &self.options.config_source {
            cmdline.append(keys::CONFIG, Some(source.as_str()));
        }

        let extra = self
            .options
            .platform_args
            .iter()
            .chain(&config.extra_kernel_args)
            .map(String::as_str)
            .chain(keys::DEFAULT_ARGS.iter().copied());
        for arg in extra {
            match arg.split_once('=') {
                Some((key, value)) => cmdline.append(key, Some(value)),
                None => cmdline.append(arg, None),
            }
        }

        let initrd = format!("/{}/{}", label, assets::INITRAMFS);
        cmdline.append("initrd", Some(initrd.as_str()));
        cmdline
    }

    fn install_bootloader(
        &self,
        syslinux: &Syslinux,
        config: &InstallConfig,
        label: BootLabel,
        current: Option<BootLabel>,
        upgrading: bool,
    ) -> MachinedResult<()> {
        let mut entries = vec![BootEntry::new(label, self.kernel_args(config, label).to_string())];
        if upgrading && let Some(current) = current {
            let running = Cmdline::read_from(&self.options.proc_cmdline)?;
            entries.push(BootEntry::new(current, running.to_string()));
        }

        syslinux.write_config(&SyslinuxConfig {
            default: label,
            entries,
        })?;
        syslinux.copy_efi_binaries(&self.options.efi_dir)?;

        if upgrading {
            syslinux.update(self.runner.as_ref(), label)?;
            syslinux.set_upgrade_label(label)?;
        } else {
            syslinux.install(self.runner.as_ref())?;
        }
        Ok(())
    }
}

/// Read the active boot label from the mounted boot partition.
pub fn current_label(boot_root: &Path) -> MachinedResult<Option<BootLabel>> {
    Ok(Syslinux::new(boot_root).labels()?.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adv::{Adv, LegacyAdv, legacy, tags};
    use crate::installer::disk::fake::FakeDisks;
    use crate::util::process::RecordingRunner;

    const DISK: &str = "/dev/sda";
    const GIB: u64 = 1024 * 1024 * 1024;

    struct Fixture {
        _dir: tempfile::TempDir,
        options: InstallOptions,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let assets_dir = dir.path().join("assets");
        std::fs::create_dir_all(&assets_dir).unwrap();
        std::fs::write(assets_dir.join(assets::KERNEL), b"kernel").unwrap();
        std::fs::write(assets_dir.join(assets::INITRAMFS), b"initramfs").unwrap();
        std::fs::write(dir.path().join("gptmbr.bin"), vec![0xeb; 512]).unwrap();
        std::fs::write(dir.path().join("cmdline"), "talos.platform=metal initrd=/A/initramfs.xz\n").unwrap();

        let options = InstallOptions {
            platform: "metal".into(),
            config_source: Some("https://example/config".into()),
            platform_args: vec!["console=ttyS0".into()],
            asset_dir: assets_dir,
            boot_root: dir.path().join("boot"),
            gptmbr: dir.path().join("gptmbr.bin"),
            efi_dir: dir.path().join("efi"),
            proc_cmdline: dir.path().join("cmdline"),
        };
        Fixture { _dir: dir, options }
    }

    fn config() -> InstallConfig {
        InstallConfig {
            disk: Some(DISK.into()),
            extra_kernel_args: vec!["talos.hostname=node-1".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_install() {
        let fx = fixture();
        let runner = Arc::new(RecordingRunner::default());
        let disks = Arc::new(FakeDisks::with_disk(DISK, 32 * GIB));
        let installer = Installer::with_backends(fx.options.clone(), runner.clone(), disks.clone());

        let report = installer.install(&config(), Sequence::Install).unwrap();
        assert_eq!(report, InstallReport { label: BootLabel::A, upgraded: false });

        let boot = &fx.options.boot_root;
        assert_eq!(std::fs::read(boot.join("A/vmlinuz")).unwrap(), b"kernel");
        assert_eq!(std::fs::read(boot.join("A/initramfs.xz")).unwrap(), b"initramfs");

        let cfg = std::fs::read_to_string(boot.join("syslinux/syslinux.cfg")).unwrap();
        assert!(cfg.starts_with("DEFAULT A\n"));
        assert!(cfg.contains("talos.config=https://example/config"));
        assert!(cfg.contains("console=ttyS0 talos.hostname=node-1"));
        assert!(cfg.contains("initrd=/A/initramfs.xz"));
        assert!(!cfg.contains("LABEL B"));

        let lines = runner.command_lines();
        assert_eq!(lines[0], "sgdisk --zap-all /dev/sda");
        assert_eq!(
            lines.last().unwrap(),
            &format!("extlinux --install {}", boot.join("syslinux").display())
        );

        let writes = disks.writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!((writes[0].0.as_str(), writes[0].1, writes[0].2.len()), (DISK, 0, 440));

        let mounts: Vec<String> = disks.mounts.lock().iter().map(|(s, _)| s.clone()).collect();
        assert_eq!(mounts, vec!["/dev/sda3", "/dev/sda1"]);
        assert_eq!(disks.unmounts.lock().len(), 2);
    }

    #[test]
    fn test_upgrade_flips_label() {
        let fx = fixture();
        let syslinux = Syslinux::new(&fx.options.boot_root);
        syslinux
            .write_config(&SyslinuxConfig {
                default: BootLabel::A,
                entries: vec![BootEntry::new(BootLabel::A, "talos.platform=metal")],
            })
            .unwrap();
        let mut ldlinux = vec![0u8; 2048];
        ldlinux.extend(LegacyAdv::new().bytes());
        std::fs::write(syslinux.ldlinux_path(), ldlinux).unwrap();

        let runner = Arc::new(RecordingRunner::default());
        let disks = Arc::new(FakeDisks::with_disk(DISK, 32 * GIB).label(labels::BOOT, "/dev/sda3"));
        let installer = Installer::with_backends(fx.options.clone(), runner.clone(), disks.clone());

        let report = installer.install(&config(), Sequence::Upgrade).unwrap();
        assert_eq!(report, InstallReport { label: BootLabel::B, upgraded: true });

        let boot = &fx.options.boot_root;
        assert!(boot.join("B/vmlinuz").exists());
        let cfg = std::fs::read_to_string(syslinux.config_path()).unwrap();
        assert!(cfg.starts_with("DEFAULT B\n"));
        assert!(cfg.contains("LABEL A"));
        assert!(cfg.contains("initrd=/B/initramfs.xz"));

        let dir = syslinux.dir().display().to_string();
        assert_eq!(
            runner.command_lines(),
            vec![format!("extlinux --update {}", dir), format!("extlinux --once=B {}", dir)]
        );
        // Boot code is rewritten on every install, upgrades included.
        let writes = disks.writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!((writes[0].0.as_str(), writes[0].1, writes[0].2.len()), (DISK, 0, 440));

        let bytes = std::fs::read(syslinux.ldlinux_path()).unwrap();
        let adv = LegacyAdv::parse(&bytes[bytes.len() - 2 * legacy::SIZE..]).unwrap();
        assert_eq!(adv.read_tag(tags::UPGRADE).as_deref(), Some("B"));
    }

    #[test]
    fn test_upgrade_without_boot_partition_installs_fresh() {
        let fx = fixture();
        let runner = Arc::new(RecordingRunner::default());
        let disks = Arc::new(FakeDisks::with_disk(DISK, 32 * GIB));
        let installer = Installer::with_backends(fx.options.clone(), runner.clone(), disks);

        let report = installer.install(&config(), Sequence::Upgrade).unwrap();
        assert_eq!(report.label, BootLabel::A);
        assert!(!report.upgraded);
        assert_eq!(runner.programs()[0], "sgdisk");
    }

    #[test]
    fn test_zero_requested() {
        let fx = fixture();
        let disks = Arc::new(FakeDisks::with_disk(DISK, 32 * GIB));
        let installer = Installer::with_backends(
            fx.options.clone(),
            Arc::new(RecordingRunner::default()),
            disks.clone(),
        );
        let mut cfg = config();
        cfg.zero = true;
        cfg.bootloader = false;

        installer.install(&cfg, Sequence::Install).unwrap();
        assert_eq!(disks.zeroed.lock().as_slice(), [DISK]);
        assert_eq!(disks.writes.lock().len(), 1);
        assert!(!Syslinux::new(&fx.options.boot_root).config_path().exists());
    }

    #[test]
    fn test_failure_still_unmounts() {
        let fx = fixture();
        let disks = Arc::new(FakeDisks::with_disk(DISK, 32 * GIB));
        let installer = Installer::with_backends(
            fx.options.clone(),
            Arc::new(RecordingRunner::failing_on("extlinux")),
            disks.clone(),
        );

        assert!(installer.install(&config(), Sequence::Install).is_err());
        assert_eq!(disks.unmounts.lock().len(), 2);
    }

    #[test]
    fn test_missing_disk_is_precondition() {
        let installer = Installer::with_backends(
            InstallOptions::default(),
            Arc::new(RecordingRunner::default()),
            Arc::new(FakeDisks::default()),
        );
        let err = installer
            .install(&InstallConfig::default(), Sequence::Install)
            .unwrap_err();
        assert!(matches!(err, MachinedError::Precondition(_)));
    }

    #[test]
    fn test_kernel_args_order() {
        let fx = fixture();
        let installer = Installer::with_backends(
            fx.options.clone(),
            Arc::new(RecordingRunner::default()),
            Arc::new(FakeDisks::default()),
        );
        let args = installer.kernel_args(&config(), BootLabel::B).to_args();
        assert_eq!(args[0], "talos.platform=metal");
        assert_eq!(args[1], "talos.config=https://example/config");
        assert_eq!(args[2], "console=ttyS0");
        assert_eq!(args[3], "talos.hostname=node-1");
        assert_eq!(args.last().unwrap(), "initrd=/B/initramfs.xz");
        assert!(args.contains(&"slab_nomerge".to_string()));
    }
}
