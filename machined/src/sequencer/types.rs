use crate::runtime::Sequence;

/// Options of an upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeOptions {
    /// Installer image; the configured one when `None`.
    pub image: Option<String>,
    /// Keep this node's etcd data.
    pub preserve: bool,
    /// Pull the image before running it.
    pub pull: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetOptions {
    /// Leave the cluster before wiping the disk.
    pub graceful: bool,
}

/// A lifecycle sequence together with its options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleRequest {
    Initialize,
    Install,
    Boot,
    Shutdown,
    Upgrade(UpgradeOptions),
    Reset(ResetOptions),
}

impl LifecycleRequest {
    pub fn sequence(&self) -> Sequence {
        match self {
            LifecycleRequest::Initialize => Sequence::Initialize,
            LifecycleRequest::Install => Sequence::Install,
            LifecycleRequest::Boot => Sequence::Boot,
            LifecycleRequest::Shutdown => Sequence::Shutdown,
            LifecycleRequest::Upgrade(_) => Sequence::Upgrade,
            LifecycleRequest::Reset(_) => Sequence::Reset,
        }
    }
}
