//! Tasks: installer and A/B bootloader bookkeeping.

use super::Ctx;
use crate::adv::{Adv, LegacyAdv, tags};
use crate::pipeline::PhaseTask;
use crate::runtime::{Mode, Sequence};
use crate::util::blocking;
use async_trait::async_trait;
use machined_shared::{MachinedError, MachinedResult};
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{debug, info, warn};

/// Fails the boot when no bootloader was ever installed.
pub struct VerifyInstallation;

#[async_trait]
impl PhaseTask<Ctx> for VerifyInstallation {
    fn name(&self) -> &str {
        "verify_installation"
    }

    fn supports(&self, mode: Mode) -> bool {
        mode.requires_install()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let syslinux = ctx.layout().syslinux();
        let (current, _) = blocking(move || syslinux.labels()).await?;
        match current {
            Some(label) => {
                debug!(%label, "Bootloader installed");
                Ok(())
            }
            None => Err(MachinedError::Precondition(
                "bootloader is not installed".to_string(),
            )),
        }
    }
}

/// Marks the running label as good: clears the one-shot upgrade tag from
/// the syslinux ADV and from META.
pub struct UpdateBootloader;

#[async_trait]
impl PhaseTask<Ctx> for UpdateBootloader {
    fn name(&self) -> &str {
        "update_bootloader"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let ldlinux = ctx.layout().syslinux().ldlinux_path();
        if blocking(move || clear_upgrade_tag(&ldlinux)).await? {
            info!("Cleared upgrade label from bootloader ADV");
        }

        if let Some(meta) = ctx.meta()
            && meta.delete_tag(tags::UPGRADE)?
        {
            meta.flush().await?;
            info!("Cleared upgrade tag from META");
        }
        Ok(())
    }
}

/// Remove the upgrade tag from the ADV at the tail of `ldlinux`.
///
/// The file is only rewritten when the tag was present. A missing file or
/// an unreadable ADV leaves nothing to clear.
fn clear_upgrade_tag(ldlinux: &Path) -> MachinedResult<bool> {
    let mut file = match OpenOptions::new().read(true).write(true).open(ldlinux) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let mut adv = match LegacyAdv::load(&mut file) {
        Ok(adv) => adv,
        Err(e) => {
            warn!(path = %ldlinux.display(), error = %e, "Unreadable ADV");
            return Ok(false);
        }
    };

    if !adv.delete_tag(tags::UPGRADE) {
        return Ok(false);
    }
    adv.store(&mut file)?;
    file.sync_all()?;
    Ok(true)
}

/// Hands the machine's install configuration to the installer.
pub struct RunInstaller {
    sequence: Sequence,
    pull: bool,
    image: Option<String>,
}

impl RunInstaller {
    pub fn install() -> Self {
        Self {
            sequence: Sequence::Install,
            pull: false,
            image: None,
        }
    }

    /// Upgrade to `image`, or to the configured image when `None`.
    pub fn upgrade(image: Option<String>, pull: bool) -> Self {
        Self {
            sequence: Sequence::Upgrade,
            pull,
            image,
        }
    }
}

#[async_trait]
impl PhaseTask<Ctx> for RunInstaller {
    fn name(&self) -> &str {
        "run_installer"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let mut install = ctx.config()?.machine.install;
        if let Some(image) = self.image {
            install.image = Some(image);
        }
        info!(sequence = %self.sequence, image = ?install.image, "Running installer");
        ctx.installer().run(&install, self.sequence, self.pull).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adv::legacy;

    fn ldlinux_with(tags: &[(u8, &str)]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 4 * legacy::SIZE]).unwrap();

        let mut adv = LegacyAdv::new();
        for (tag, value) in tags {
            adv.set_tag(*tag, value).unwrap();
        }
        let mut handle = OpenOptions::new().write(true).open(file.path()).unwrap();
        adv.store(&mut handle).unwrap();
        file
    }

    #[test]
    fn test_clear_upgrade_tag() {
        let file = ldlinux_with(&[(tags::UPGRADE, "B"), (tags::USER_RESERVED_1, "keep")]);

        assert!(clear_upgrade_tag(file.path()).unwrap());

        let mut handle = std::fs::File::open(file.path()).unwrap();
        let adv = LegacyAdv::load(&mut handle).unwrap();
        assert_eq!(adv.read_tag(tags::UPGRADE), None);
        assert_eq!(adv.read_tag(tags::USER_RESERVED_1).as_deref(), Some("keep"));
    }

    #[test]
    fn test_clear_upgrade_tag_leaves_file_untouched_when_absent() {
        let file = ldlinux_with(&[(tags::USER_RESERVED_1, "keep")]);
        let before = std::fs::read(file.path()).unwrap();

        assert!(!clear_upgrade_tag(file.path()).unwrap());
        assert_eq!(std::fs::read(file.path()).unwrap(), before);
    }

    #[test]
    fn test_clear_upgrade_tag_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!clear_upgrade_tag(&dir.path().join("ldlinux.sys")).unwrap());
    }
}
