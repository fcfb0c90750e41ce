//! Syslinux A/B boot configuration.
//!
//! The first non-comment line of `syslinux.cfg` names the active label:
//!
//! ```text
//! DEFAULT B
//!   LABEL B
//!     KERNEL /B/vmlinuz
//!     INITRD /B/initramfs.xz
//!     APPEND talos.platform=metal ...
//! ```

use crate::adv::{Adv, LegacyAdv, tags};
use crate::constants::{assets, paths};
use crate::util::process::{CommandRunner, args};
use machined_shared::{MachinedError, MachinedResult};
use regex::Regex;
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootLabel {
    A,
    B,
    /// Terminal: a reset node does not flip back.
    Reset,
}

impl BootLabel {
    /// The label an upgrade installs into.
    pub fn flip(self) -> Self {
        match self {
            BootLabel::A => BootLabel::B,
            BootLabel::B => BootLabel::A,
            BootLabel::Reset => BootLabel::Reset,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BootLabel::A => "A",
            BootLabel::B => "B",
            BootLabel::Reset => "Reset",
        }
    }
}

impl fmt::Display for BootLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BootLabel {
    type Err = MachinedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" => Ok(BootLabel::A),
            "B" => Ok(BootLabel::B),
            "Reset" => Ok(BootLabel::Reset),
            other => Err(MachinedError::InvalidArgument(format!(
                "unknown syslinux label: {:?}",
                other
            ))),
        }
    }
}

/// One `LABEL` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub label: BootLabel,
    pub kernel: String,
    pub initrd: String,
    pub append: String,
}

impl BootEntry {
    /// Entry booting the assets installed under `/<label>/`.
    pub fn new(label: BootLabel, append: impl Into<String>) -> Self {
        Self {
            label,
            kernel: format!("/{}/{}", label, assets::KERNEL),
            initrd: format!("/{}/{}", label, assets::INITRAMFS),
            append: append.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyslinuxConfig {
    pub default: BootLabel,
    pub entries: Vec<BootEntry>,
}

impl SyslinuxConfig {
    pub fn render(&self) -> String {
        let mut out = format!("DEFAULT {}\n", self.default);
        for entry in &self.entries {
            out.push_str(&format!(
                "\n  LABEL {}\n    KERNEL {}\n    INITRD {}\n    APPEND {}\n",
                entry.label, entry.kernel, entry.initrd, entry.append
            ));
        }
        out
    }
}

fn default_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^DEFAULT\s(.*)").expect("valid regex"))
}

/// Active label named by the first non-comment line of `contents`.
pub fn parse_default(contents: &str) -> MachinedResult<BootLabel> {
    let line = contents
        .lines()
        .map(str::trim_end)
        .find(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .ok_or_else(|| MachinedError::Corrupted("empty syslinux config".to_string()))?;

    let captures = default_re().captures(line).ok_or_else(|| {
        MachinedError::Corrupted(format!("expected DEFAULT line, got {:?}", line))
    })?;
    captures[1].parse()
}

/// Syslinux files on a mounted boot partition.
#[derive(Debug, Clone)]
pub struct Syslinux {
    root: PathBuf,
}

impl Default for Syslinux {
    fn default() -> Self {
        Self::new(paths::BOOT_MOUNT_POINT)
    }
}

impl Syslinux {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join("syslinux")
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir().join("syslinux.cfg")
    }

    pub fn efi_dir(&self) -> PathBuf {
        self.root.join("EFI").join("syslinux")
    }

    pub fn efi_config_path(&self) -> PathBuf {
        self.efi_dir().join("syslinux.cfg")
    }

    pub fn ldlinux_path(&self) -> PathBuf {
        self.dir().join("ldlinux.sys")
    }

    /// Current and next labels. `None` when nothing is installed yet, in
    /// which case the next label is A.
    pub fn labels(&self) -> MachinedResult<(Option<BootLabel>, BootLabel)> {
        match std::fs::read_to_string(self.config_path()) {
            Ok(contents) => {
                let current = parse_default(&contents)?;
                Ok((Some(current), current.flip()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((None, BootLabel::A)),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the configuration to the legacy and EFI locations.
    pub fn write_config(&self, config: &SyslinuxConfig) -> MachinedResult<()> {
        let rendered = config.render();
        for path in [self.config_path(), self.efi_config_path()] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &rendered)?;
        }
        info!(default = %config.default, "Wrote syslinux config");
        Ok(())
    }

    /// Copy the EFI loader binaries next to the EFI configuration.
    pub fn copy_efi_binaries(&self, source: &Path) -> MachinedResult<()> {
        if !source.is_dir() {
            warn!(dir = %source.display(), "No EFI syslinux binaries, skipping");
            return Ok(());
        }
        let dest = self.efi_dir();
        std::fs::create_dir_all(&dest)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::copy(entry.path(), dest.join(entry.file_name()))?;
            }
        }
        Ok(())
    }

    /// `extlinux --install`: first installation of the bootloader.
    pub fn install(&self, runner: &dyn CommandRunner) -> MachinedResult<()> {
        let dir = self.dir();
        std::fs::create_dir_all(&dir)?;
        runner.run(
            "extlinux",
            &args(["--install".to_string(), dir.to_string_lossy().into_owned()]),
        )?;
        Ok(())
    }

    /// `extlinux --update` followed by a one-shot boot of `label`.
    pub fn update(&self, runner: &dyn CommandRunner, label: BootLabel) -> MachinedResult<()> {
        let dir = self.dir().to_string_lossy().into_owned();
        runner.run("extlinux", &args(["--update".to_string(), dir.clone()]))?;
        runner.run("extlinux", &args([format!("--once={}", label), dir]))?;
        Ok(())
    }

    /// Record `label` in the `ldlinux.sys` ADV as the upgrade label.
    pub fn set_upgrade_label(&self, label: BootLabel) -> MachinedResult<()> {
        let path = self.ldlinux_path();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut adv = LegacyAdv::load(&mut file).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Invalid ADV, starting empty");
            LegacyAdv::new()
        });
        adv.set_tag(tags::UPGRADE, label.as_str())?;
        adv.store(&mut file)?;
        file.sync_all()?;
        Ok(())
    }
}
