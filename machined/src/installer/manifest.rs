//! Partition layout of an installation.
//!
//! A [`Manifest`] maps every disk to the partitions created on it, in order.
//! Partition numbers follow that order starting at 1.

use super::disk::DiskOps;
use super::syslinux::BootLabel;
use crate::config::{DiskConfig, InstallConfig};
use crate::constants::{assets, gpt, labels, layout};
use crate::util::process::{CommandRunner, args};
use machined_shared::{MachinedError, MachinedResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filesystem {
    Xfs,
    Vfat,
    /// Raw partition, left unformatted.
    None,
}

impl Filesystem {
    pub fn fstype(&self) -> &'static str {
        match self {
            Filesystem::Xfs => "xfs",
            Filesystem::Vfat => "vfat",
            Filesystem::None => "",
        }
    }
}

/// File copied onto a partition, `destination` relative to its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// One partition to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub device: String,
    pub label: String,
    /// Bytes; 0 takes the rest of the disk.
    pub size: u64,
    /// Format even when a filesystem is already present.
    pub force: bool,
    pub filesystem: Filesystem,
    pub partition_type: &'static str,
    pub assets: Vec<Asset>,
    /// Device node, known once the partition exists.
    pub partition: Option<String>,
}

impl Target {
    fn new(
        device: &str,
        label: &str,
        size: u64,
        filesystem: Filesystem,
        partition_type: &'static str,
    ) -> Self {
        Self {
            device: device.to_string(),
            label: label.to_string(),
            size,
            force: false,
            filesystem,
            partition_type,
            assets: Vec::new(),
            partition: None,
        }
    }

    fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    fn with_boot_assets(mut self, asset_dir: &Path, label: BootLabel) -> Self {
        self.assets = [assets::KERNEL, assets::INITRAMFS]
            .iter()
            .map(|name| Asset {
                source: asset_dir.join(name),
                destination: Path::new(label.as_str()).join(name),
            })
            .collect();
        self
    }

    pub fn is_boot(&self) -> bool {
        self.label == labels::BOOT
    }

    pub fn is_ephemeral(&self) -> bool {
        self.label == labels::EPHEMERAL
    }

    /// `sgdisk` arguments creating this target as partition `number`.
    fn sgdisk_args(&self, number: usize) -> Vec<String> {
        let end = if self.size == 0 {
            "0".to_string()
        } else {
            format!("+{}K", self.size.div_ceil(1024))
        };
        let mut out = vec![
            format!("--new={}:0:{}", number, end),
            format!("--typecode={}:{}", number, self.partition_type),
        ];
        if !self.label.is_empty() {
            out.push(format!("--change-name={}:{}", number, self.label));
        }
        out.push(self.device.clone());
        out
    }

    /// Create the filesystem on `partition`.
    pub fn format(&self, runner: &dyn CommandRunner, partition: &str) -> MachinedResult<()> {
        info!(partition, label = %self.label, fstype = self.filesystem.fstype(), "Formatting partition");
        match self.filesystem {
            Filesystem::Xfs => {
                let mut argv = args(["-f"]);
                if !self.label.is_empty() {
                    argv.extend(args(["-L", self.label.as_str()]));
                }
                argv.push(partition.to_string());
                runner.run("mkfs.xfs", &argv)?;
            }
            Filesystem::Vfat => {
                runner.run(
                    "mkfs.vfat",
                    &args(["-F", "32", "-n", self.label.as_str(), partition]),
                )?;
            }
            Filesystem::None => {}
        }
        Ok(())
    }

    /// Copy the assets onto the partition mounted at `root`.
    pub fn save(&self, root: &Path) -> MachinedResult<()> {
        for asset in &self.assets {
            let dest = root.join(&asset.destination);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            debug!(from = %asset.source.display(), to = %dest.display(), "Copying asset");
            std::fs::copy(&asset.source, &dest).map_err(|e| {
                MachinedError::Storage(format!(
                    "failed to copy {} to {}: {}",
                    asset.source.display(),
                    dest.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub targets: BTreeMap<String, Vec<Target>>,
}

impl Manifest {
    /// Full system disk layout for a fresh install into `label`.
    pub fn system_disk(
        disk: &str,
        config: &InstallConfig,
        label: BootLabel,
        asset_dir: &Path,
    ) -> Self {
        let force = config.force;
        let targets = vec![
            Target::new(disk, labels::EFI, layout::EFI_SIZE, Filesystem::Vfat, gpt::EFI_SYSTEM)
                .forced(force),
            Target::new(disk, labels::BIOS, layout::BIOS_SIZE, Filesystem::None, gpt::BIOS_BOOT),
            Target::new(disk, labels::BOOT, layout::BOOT_SIZE, Filesystem::Xfs, gpt::LINUX_FILESYSTEM)
                .forced(force)
                .with_boot_assets(asset_dir, label),
            Target::new(disk, labels::META, layout::META_SIZE, Filesystem::None, gpt::LINUX_FILESYSTEM),
            Target::new(disk, labels::STATE, layout::STATE_SIZE, Filesystem::Xfs, gpt::LINUX_FILESYSTEM)
                .forced(force),
            Target::new(disk, labels::EPHEMERAL, 0, Filesystem::Xfs, gpt::LINUX_FILESYSTEM)
                .forced(force),
        ];
        Self {
            targets: BTreeMap::from([(disk.to_string(), targets)]),
        }
    }

    /// Targets touched by an upgrade: new boot assets, and the ephemeral
    /// partition when it is to be wiped.
    pub fn upgrade(disk: &str, config: &InstallConfig, label: BootLabel, asset_dir: &Path) -> Self {
        let targets = vec![
            Target::new(disk, labels::BOOT, layout::BOOT_SIZE, Filesystem::Xfs, gpt::LINUX_FILESYSTEM)
                .with_boot_assets(asset_dir, label),
            Target::new(disk, labels::EPHEMERAL, 0, Filesystem::Xfs, gpt::LINUX_FILESYSTEM)
                .forced(config.force || config.wipe),
        ];
        Self {
            targets: BTreeMap::from([(disk.to_string(), targets)]),
        }
    }

    /// Unlabeled xfs partitions on extra user disks.
    pub fn user_disks(disks: &[DiskConfig]) -> Self {
        let targets = disks
            .iter()
            .map(|disk| {
                let partitions = disk
                    .partitions
                    .iter()
                    .map(|p| {
                        Target::new(&disk.device, "", p.size, Filesystem::Xfs, gpt::LINUX_FILESYSTEM)
                            .forced(true)
                    })
                    .collect();
                (disk.device.clone(), partitions)
            })
            .collect();
        Self { targets }
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.values().flatten()
    }

    pub fn target(&self, label: &str) -> Option<&Target> {
        self.targets().find(|t| t.label == label)
    }

    /// Check every disk can hold its targets.
    pub fn validate(&self, disks: &dyn DiskOps) -> MachinedResult<()> {
        for (disk, targets) in &self.targets {
            let growable = targets.iter().filter(|t| t.size == 0).count();
            if growable > 1 {
                return Err(MachinedError::InvalidArgument(format!(
                    "{}: only one partition may take the remaining space",
                    disk
                )));
            }

            let fixed: u64 = targets.iter().map(|t| t.size).sum();
            let capacity = disks.size(disk)?;
            let usable = capacity.saturating_sub(2 * layout::GPT_HEADER_REGION);
            if fixed > usable {
                return Err(MachinedError::Precondition(format!(
                    "{}: partitions need {} bytes, disk has {}",
                    disk, fixed, usable
                )));
            }
        }
        Ok(())
    }

    /// Partition and format every disk, in order.
    pub fn execute(&mut self, runner: &dyn CommandRunner, disks: &dyn DiskOps) -> MachinedResult<()> {
        for (disk, targets) in self.targets.iter_mut() {
            info!(disk = %disk, partitions = targets.len(), "Partitioning disk");
            runner.run("sgdisk", &args(["--zap-all", disk.as_str()]))?;

            for (i, target) in targets.iter().enumerate() {
                runner.run("sgdisk", &target.sgdisk_args(i + 1))?;
            }

            disks.reread(disk)?;

            for (i, target) in targets.iter_mut().enumerate() {
                let partition = disks.partition_path(disk, (i + 1) as u32)?;
                target.format(runner, &partition)?;
                target.partition = Some(partition);
            }
        }
        Ok(())
    }

    /// Reformat the labeled, forced targets already present on the disks.
    ///
    /// The boot partition is never reformatted here.
    pub fn reformat(&mut self, runner: &dyn CommandRunner, disks: &dyn DiskOps) -> MachinedResult<()> {
        for (disk, targets) in self.targets.iter_mut() {
            disks.reread(disk)?;

            for target in targets.iter_mut() {
                if target.is_boot() || target.label.is_empty() {
                    continue;
                }
                let Some(partition) = disks.find_by_label(&target.label)? else {
                    debug!(label = %target.label, "No existing partition, skipping");
                    continue;
                };
                if target.force {
                    target.format(runner, &partition)?;
                }
                target.partition = Some(partition);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskPartition;
    use crate::installer::disk::fake::FakeDisks;
    use crate::util::process::RecordingRunner;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn install_config() -> InstallConfig {
        InstallConfig {
            disk: Some("/dev/sda".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_system_disk_layout() {
        let m = Manifest::system_disk("/dev/sda", &install_config(), BootLabel::A, Path::new("/usr/install"));
        let labels: Vec<&str> = m.targets().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["EFI", "BIOS", "BOOT", "META", "STATE", "EPHEMERAL"]);

        let boot = m.target(labels::BOOT).unwrap();
        assert_eq!(boot.assets.len(), 2);
        assert_eq!(boot.assets[0].destination, PathBuf::from("A/vmlinuz"));
        assert_eq!(boot.assets[1].source, PathBuf::from("/usr/install/initramfs.xz"));
        assert_eq!(m.target(labels::EPHEMERAL).unwrap().size, 0);
    }

    #[test]
    fn test_validate_capacity() {
        let m = Manifest::system_disk("/dev/sda", &install_config(), BootLabel::A, Path::new("/a"));
        m.validate(&FakeDisks::with_disk("/dev/sda", 32 * GIB)).unwrap();

        let err = m
            .validate(&FakeDisks::with_disk("/dev/sda", 512 * 1024 * 1024))
            .unwrap_err();
        assert!(matches!(err, MachinedError::Precondition(_)));
    }

    #[test]
    fn test_validate_single_growable() {
        let m = Manifest::user_disks(&[DiskConfig {
            device: "/dev/sdb".into(),
            partitions: vec![
                DiskPartition { mountpoint: "/var/a".into(), size: 0 },
                DiskPartition { mountpoint: "/var/b".into(), size: 0 },
            ],
        }]);
        let err = m.validate(&FakeDisks::with_disk("/dev/sdb", GIB)).unwrap_err();
        assert!(matches!(err, MachinedError::InvalidArgument(_)));
    }

    #[test]
    fn test_execute_partitions_then_formats() {
        let mut m = Manifest::system_disk("/dev/sda", &install_config(), BootLabel::A, Path::new("/a"));
        let runner = RecordingRunner::default();
        let disks = FakeDisks::with_disk("/dev/sda", 32 * GIB);

        m.execute(&runner, &disks).unwrap();

        let lines = runner.command_lines();
        assert_eq!(lines[0], "sgdisk --zap-all /dev/sda");
        assert_eq!(
            lines[1],
            format!("sgdisk --new=1:0:+102400K --typecode=1:{} --change-name=1:EFI /dev/sda", gpt::EFI_SYSTEM)
        );
        assert_eq!(
            lines[6],
            format!("sgdisk --new=6:0:0 --typecode=6:{} --change-name=6:EPHEMERAL /dev/sda", gpt::LINUX_FILESYSTEM)
        );
        // Partitioning completes before the first format.
        assert_eq!(
            &lines[7..],
            &[
                "mkfs.vfat -F 32 -n EFI /dev/sda1".to_string(),
                "mkfs.xfs -f -L BOOT /dev/sda3".to_string(),
                "mkfs.xfs -f -L STATE /dev/sda5".to_string(),
                "mkfs.xfs -f -L EPHEMERAL /dev/sda6".to_string(),
            ]
        );
        assert_eq!(disks.rereads.lock().as_slice(), ["/dev/sda"]);
        assert_eq!(m.target(labels::BOOT).unwrap().partition.as_deref(), Some("/dev/sda3"));
    }

    #[test]
    fn test_execute_stops_on_failure() {
        let mut m = Manifest::system_disk("/dev/sda", &install_config(), BootLabel::A, Path::new("/a"));
        let runner = RecordingRunner::failing_on("mkfs.vfat");
        let disks = FakeDisks::with_disk("/dev/sda", 32 * GIB);

        assert!(m.execute(&runner, &disks).is_err());
        assert!(!runner.programs().iter().any(|p| p == "mkfs.xfs"));
    }

    #[test]
    fn test_reformat_skips_boot_and_unforced() {
        let mut config = install_config();
        config.wipe = true;
        let mut m = Manifest::upgrade("/dev/sda", &config, BootLabel::B, Path::new("/a"));
        let runner = RecordingRunner::default();
        let disks = FakeDisks::with_disk("/dev/sda", 32 * GIB)
            .label(labels::BOOT, "/dev/sda3")
            .label(labels::EPHEMERAL, "/dev/sda6");

        m.reformat(&runner, &disks).unwrap();
        assert_eq!(runner.command_lines(), vec!["mkfs.xfs -f -L EPHEMERAL /dev/sda6"]);

        config.wipe = false;
        let mut m = Manifest::upgrade("/dev/sda", &config, BootLabel::B, Path::new("/a"));
        let runner = RecordingRunner::default();
        m.reformat(&runner, &disks).unwrap();
        assert!(runner.command_lines().is_empty());
    }

    #[test]
    fn test_save_copies_assets() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join(assets::KERNEL), b"kernel").unwrap();
        std::fs::write(src.path().join(assets::INITRAMFS), b"initrd").unwrap();
        let boot = tempfile::tempdir().unwrap();

        let m = Manifest::system_disk("/dev/sda", &install_config(), BootLabel::B, src.path());
        m.target(labels::BOOT).unwrap().save(boot.path()).unwrap();

        assert_eq!(std::fs::read(boot.path().join("B/vmlinuz")).unwrap(), b"kernel");
        assert_eq!(std::fs::read(boot.path().join("B/initramfs.xz")).unwrap(), b"initrd");
    }
}
