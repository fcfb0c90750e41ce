//! Root under which lifecycle tasks touch the filesystem.
//!
//! Production runs against `/`. Tests point the layout at a temporary
//! directory so file-writing tasks can run unprivileged.

use crate::constants::paths;
use crate::installer::Syslinux;
use crate::kspp::Sysctl;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SystemLayout {
    root: PathBuf,
}

impl Default for SystemLayout {
    fn default() -> Self {
        Self::new("/")
    }
}

impl SystemLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether paths resolve against the real root.
    pub fn is_host(&self) -> bool {
        self.root == Path::new("/")
    }

    /// Resolve an absolute system path under the root.
    pub fn path(&self, absolute: impl AsRef<Path>) -> PathBuf {
        let absolute = absolute.as_ref();
        self.root
            .join(absolute.strip_prefix("/").unwrap_or(absolute))
    }

    pub fn config_path(&self) -> PathBuf {
        self.path(paths::CONFIG_PATH)
    }

    pub fn system_etc(&self) -> PathBuf {
        self.path(paths::SYSTEM_ETC_PATH)
    }

    pub fn syslinux(&self) -> Syslinux {
        Syslinux::new(self.path(paths::BOOT_MOUNT_POINT))
    }

    pub fn sysctl(&self) -> Sysctl {
        Sysctl::new(self.path(paths::PROC_SYS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_joins_under_root() {
        let layout = SystemLayout::new("/tmp/root");
        assert_eq!(layout.path("/etc/hosts"), PathBuf::from("/tmp/root/etc/hosts"));
        assert_eq!(
            layout.config_path(),
            PathBuf::from("/tmp/root/system/state/config.json")
        );
        assert!(!layout.is_host());
    }

    #[test]
    fn test_host_layout_is_identity() {
        let layout = SystemLayout::default();
        assert!(layout.is_host());
        assert_eq!(layout.path(paths::KMSG), PathBuf::from(paths::KMSG));
        assert_eq!(
            layout.syslinux().ldlinux_path(),
            PathBuf::from("/boot/syslinux/ldlinux.sys")
        );
    }
}
