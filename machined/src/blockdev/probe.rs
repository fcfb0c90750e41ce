//! Filesystem superblock detection and label lookup.

use crate::constants::paths;
use machined_shared::{MachinedError, MachinedResult};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Bytes read from the start of a device; covers the ISO9660 descriptor.
const PROBE_LEN: usize = 0x8000 + 2048;

const ISO9660_OFFSET: usize = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    Xfs,
    Vfat,
    Iso9660,
    Squashfs,
}

impl FilesystemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilesystemKind::Xfs => "xfs",
            FilesystemKind::Vfat => "vfat",
            FilesystemKind::Iso9660 => "iso9660",
            FilesystemKind::Squashfs => "squashfs",
        }
    }
}

/// Detected superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub kind: FilesystemKind,
    pub label: String,
}

/// Match known superblock magics in the first bytes of a device.
pub fn detect(buf: &[u8]) -> Option<Superblock> {
    if buf.len() >= 120 && &buf[0..4] == b"XFSB" {
        return Some(Superblock {
            kind: FilesystemKind::Xfs,
            label: trim_label(&buf[108..120]),
        });
    }

    if buf.len() >= 4 && &buf[0..4] == b"hsqs" {
        return Some(Superblock {
            kind: FilesystemKind::Squashfs,
            label: String::new(),
        });
    }

    if buf.len() >= 512 && buf[510] == 0x55 && buf[511] == 0xaa {
        if &buf[0x52..0x57] == b"FAT32" {
            return Some(Superblock {
                kind: FilesystemKind::Vfat,
                label: trim_label(&buf[0x47..0x52]),
            });
        }
        if &buf[0x36..0x39] == b"FAT" {
            return Some(Superblock {
                kind: FilesystemKind::Vfat,
                label: trim_label(&buf[0x2b..0x36]),
            });
        }
    }

    if buf.len() >= ISO9660_OFFSET + 72 && &buf[ISO9660_OFFSET + 1..ISO9660_OFFSET + 6] == b"CD001"
    {
        return Some(Superblock {
            kind: FilesystemKind::Iso9660,
            label: trim_label(&buf[ISO9660_OFFSET + 40..ISO9660_OFFSET + 72]),
        });
    }

    None
}

fn trim_label(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    let label = String::from_utf8_lossy(&raw[..end]).trim_end().to_string();
    if label == "NO NAME" {
        String::new()
    } else {
        label
    }
}

/// Probe the filesystem on `device`. `None` when no known superblock matches.
pub fn probe_filesystem(device: impl AsRef<Path>) -> MachinedResult<Option<Superblock>> {
    let mut file = File::open(device.as_ref())?;
    let mut buf = Vec::with_capacity(PROBE_LEN);
    file.by_ref().take(PROBE_LEN as u64).read_to_end(&mut buf)?;
    Ok(detect(&buf))
}

/// Locates devices through sysfs.
#[derive(Debug, Clone)]
pub struct Prober {
    sys_class_block: PathBuf,
    dev_root: PathBuf,
}

impl Default for Prober {
    fn default() -> Self {
        Self {
            sys_class_block: PathBuf::from(paths::SYS_CLASS_BLOCK),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

impl Prober {
    pub fn new(sys_class_block: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_class_block: sys_class_block.into(),
            dev_root: dev_root.into(),
        }
    }

    pub fn sys_class_block(&self) -> &Path {
        &self.sys_class_block
    }

    fn block_names(&self) -> MachinedResult<Vec<String>> {
        let mut names: Vec<String> = std::fs::read_dir(&self.sys_class_block)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Partition whose GPT name equals `label`, read from sysfs `uevent`.
    pub fn find_by_partition_label(&self, label: &str) -> MachinedResult<PathBuf> {
        for name in self.block_names()? {
            let uevent = self.sys_class_block.join(&name).join("uevent");
            let Ok(contents) = std::fs::read_to_string(&uevent) else {
                continue;
            };
            if contents
                .lines()
                .any(|line| line.strip_prefix("PARTNAME=") == Some(label))
            {
                return Ok(self.dev_root.join(name));
            }
        }
        Err(MachinedError::NotFound(format!(
            "no partition labeled {}",
            label
        )))
    }

    /// Device carrying a filesystem labeled `label`.
    pub fn find_by_filesystem_label(&self, label: &str) -> MachinedResult<PathBuf> {
        for name in self.block_names()? {
            let device = self.dev_root.join(&name);
            match probe_filesystem(&device) {
                Ok(Some(sb)) if sb.label == label => return Ok(device),
                Ok(_) => {}
                Err(e) => tracing::trace!(device = %device.display(), error = %e, "Probe skipped"),
            }
        }
        Err(MachinedError::NotFound(format!(
            "no filesystem labeled {}",
            label
        )))
    }

    /// Filesystem label first, partition label as fallback.
    pub fn find_by_label(&self, label: &str) -> MachinedResult<PathBuf> {
        self.find_by_filesystem_label(label)
            .or_else(|_| self.find_by_partition_label(label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xfs(label: &str) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        buf[0..4].copy_from_slice(b"XFSB");
        buf[108..108 + label.len()].copy_from_slice(label.as_bytes());
        buf
    }

    #[test]
    fn test_detect_xfs() {
        let sb = detect(&xfs("EPHEMERAL")).unwrap();
        assert_eq!(sb.kind, FilesystemKind::Xfs);
        assert_eq!(sb.label, "EPHEMERAL");
    }

    #[test]
    fn test_detect_vfat32() {
        let mut buf = vec![0u8; 512];
        buf[510] = 0x55;
        buf[511] = 0xaa;
        buf[0x52..0x5a].copy_from_slice(b"FAT32   ");
        buf[0x47..0x52].copy_from_slice(b"EFI        ");
        let sb = detect(&buf).unwrap();
        assert_eq!(sb.kind, FilesystemKind::Vfat);
        assert_eq!(sb.label, "EFI");
    }

    #[test]
    fn test_detect_iso9660() {
        let mut buf = vec![0u8; PROBE_LEN];
        buf[ISO9660_OFFSET] = 1;
        buf[ISO9660_OFFSET + 1..ISO9660_OFFSET + 6].copy_from_slice(b"CD001");
        buf[ISO9660_OFFSET + 40..ISO9660_OFFSET + 45].copy_from_slice(b"TALOS");
        let sb = detect(&buf).unwrap();
        assert_eq!(sb.kind, FilesystemKind::Iso9660);
        assert_eq!(sb.label, "TALOS");
    }

    #[test]
    fn test_detect_nothing() {
        assert_eq!(detect(&[0u8; 1024]), None);
        assert_eq!(detect(&[]), None);
    }

    #[test]
    fn test_prober_finds_labels() {
        let tmp = tempfile::tempdir().unwrap();
        let sys = tmp.path().join("sys");
        let dev = tmp.path().join("dev");
        std::fs::create_dir_all(sys.join("sda4")).unwrap();
        std::fs::create_dir_all(sys.join("sda6")).unwrap();
        std::fs::create_dir_all(&dev).unwrap();
        std::fs::write(sys.join("sda4/uevent"), "MAJOR=8\nPARTNAME=META\n").unwrap();
        std::fs::write(sys.join("sda6/uevent"), "MAJOR=8\nPARTNAME=EPHEMERAL\n").unwrap();
        std::fs::write(dev.join("sda4"), vec![0u8; 1024]).unwrap();
        std::fs::write(dev.join("sda6"), xfs("EPHEMERAL")).unwrap();

        let prober = Prober::new(&sys, &dev);
        assert_eq!(prober.find_by_partition_label("META").unwrap(), dev.join("sda4"));
        assert_eq!(
            prober.find_by_filesystem_label("EPHEMERAL").unwrap(),
            dev.join("sda6")
        );
        assert_eq!(prober.find_by_label("META").unwrap(), dev.join("sda4"));
        assert!(prober.find_by_label("STATE").unwrap_err().is_not_found());
    }
}
