//! Machine configuration document.
//!
//! JSON, optionally gzip-compressed. Loaded from the state partition when
//! persisted, otherwise fetched from the platform at every boot.

use crate::constants::paths;
use crate::runtime::Mode;
use flate2::read::GzDecoder;
use machined_shared::{MachinedError, MachinedResult, MultiError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn default_true() -> bool {
    true
}

fn default_permissions() -> u32 {
    0o644
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfig {
    #[serde(default)]
    pub debug: bool,
    /// Keep the configuration on the state partition across reboots.
    #[serde(default = "default_true")]
    pub persist: bool,
    pub machine: MachineSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    ControlPlane,
    Worker,
}

impl MachineType {
    pub fn is_control_plane(&self) -> bool {
        matches!(self, MachineType::ControlPlane)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSection {
    #[serde(rename = "type")]
    pub machine_type: MachineType,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub disks: Vec<DiskConfig>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub files: Vec<FileConfig>,
    #[serde(default)]
    pub sysctls: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallConfig {
    pub disk: Option<String>,
    /// Installer image reference.
    pub image: Option<String>,
    #[serde(default = "default_true")]
    pub bootloader: bool,
    /// Reformat existing partitions on upgrade.
    #[serde(default)]
    pub force: bool,
    /// Zero target disks before partitioning.
    #[serde(default)]
    pub zero: bool,
    /// Wipe the ephemeral partition on upgrade.
    #[serde(default)]
    pub wipe: bool,
    #[serde(default)]
    pub extra_kernel_args: Vec<String>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            disk: None,
            image: None,
            bootloader: true,
            force: false,
            zero: false,
            wipe: false,
            extra_kernel_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub device: String,
    #[serde(default)]
    pub partitions: Vec<DiskPartition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskPartition {
    pub mountpoint: String,
    /// Bytes; 0 takes the rest of the disk.
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOp {
    Create,
    Append,
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    pub path: String,
    pub content: String,
    #[serde(default = "default_permissions")]
    pub permissions: u32,
    pub op: FileOp,
}

impl FileConfig {
    /// Whether the file lives on the ephemeral partition.
    pub fn in_var(&self) -> bool {
        Path::new(&self.path).starts_with(paths::EPHEMERAL_MOUNT_POINT)
    }
}

impl MachineConfig {
    /// Parse a document, gunzipping it first when compressed.
    pub fn from_bytes(bytes: &[u8]) -> MachinedResult<Self> {
        if bytes.starts_with(&GZIP_MAGIC) {
            let mut decoded = Vec::new();
            GzDecoder::new(bytes)
                .read_to_end(&mut decoded)
                .map_err(|e| MachinedError::Config(format!("error unzipping machine config: {}", e)))?;
            return Self::parse(&decoded);
        }
        Self::parse(bytes)
    }

    fn parse(bytes: &[u8]) -> MachinedResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| MachinedError::Config(format!("failed to parse config: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> MachinedResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MachinedError::NotFound(format!("config {}", path.display()))
            } else {
                MachinedError::Io(e)
            }
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> MachinedResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| MachinedError::Config(format!("failed to serialize config: {}", e)))
    }

    /// Write the document readable by root only.
    pub fn save(&self, path: impl AsRef<Path>) -> MachinedResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_bytes()?)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    /// Check the document against `mode`, reporting every problem at once.
    pub fn validate(&self, mode: Mode) -> MachinedResult<()> {
        let mut errors = MultiError::new();
        let machine = &self.machine;

        if mode.requires_install() && machine.install.disk.as_deref().is_none_or(str::is_empty) {
            errors.push(MachinedError::Config(format!(
                "install disk is required in {} mode",
                mode
            )));
        }

        for disk in &machine.disks {
            let growable = disk.partitions.iter().filter(|p| p.size == 0).count();
            if growable > 1 {
                errors.push(MachinedError::Config(format!(
                    "disk {}: only one partition may take the remaining space",
                    disk.device
                )));
            }
            for partition in &disk.partitions {
                if !Path::new(&partition.mountpoint).is_absolute() {
                    errors.push(MachinedError::Config(format!(
                        "disk {}: mountpoint {:?} is not absolute",
                        disk.device, partition.mountpoint
                    )));
                }
            }
        }

        for file in &machine.files {
            if !Path::new(&file.path).is_absolute() {
                errors.push(MachinedError::Config(format!(
                    "file path {:?} is not absolute",
                    file.path
                )));
            } else if file.op == FileOp::Create && !file.in_var() {
                errors.push(MachinedError::Config(format!(
                    "create operation not allowed outside of /var: {:?}",
                    file.path
                )));
            }
        }

        errors
            .into_result()
            .map_err(|errors| MachinedError::Config(errors.to_string()))
    }
}
