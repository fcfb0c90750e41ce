use serde::{Deserialize, Serialize};
use std::fmt;

/// How the node is running. Decides which tasks apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Metal,
    Cloud,
    Container,
    Interactive,
}

impl Mode {
    /// Whether the node boots from a disk this process installs.
    pub fn requires_install(&self) -> bool {
        matches!(self, Mode::Metal | Mode::Interactive)
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Mode::Container)
    }

    /// Mode of a platform by name.
    pub fn for_platform(platform: &str) -> Self {
        match platform {
            "metal" => Mode::Metal,
            "container" | "docker" => Mode::Container,
            "interactive" | "iso" => Mode::Interactive,
            _ => Mode::Cloud,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Metal => "metal",
            Mode::Cloud => "cloud",
            Mode::Container => "container",
            Mode::Interactive => "interactive",
        };
        f.write_str(name)
    }
}

/// Top-level lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sequence {
    Boot,
    Shutdown,
    Upgrade,
    Reset,
    Initialize,
    Install,
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_for_platform() {
        assert_eq!(Mode::for_platform("metal"), Mode::Metal);
        assert_eq!(Mode::for_platform("container"), Mode::Container);
        assert_eq!(Mode::for_platform("aws"), Mode::Cloud);
        assert!(Mode::Metal.requires_install());
        assert!(!Mode::Cloud.requires_install());
    }

    #[test]
    fn test_display() {
        assert_eq!(Mode::Container.to_string(), "container");
        assert_eq!(Sequence::Upgrade.to_string(), "Upgrade");
    }
}
