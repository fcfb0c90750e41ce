//! Runtime: mode, shared state and collaborators of the lifecycle tasks.

pub mod collaborators;
mod core;
mod layout;
mod mode;

pub use self::core::{Collaborators, Runtime, RuntimeBuilder};
pub use collaborators::{
    ClusterOperations, ConfigFetcher, Container, ImagePuller, InProcessInstaller, InstallerRunner,
    LocalFetcher, Metal, NetworkConfigurator, Platform, ServiceState, SystemServices, Unmanaged,
    platform_for,
};
pub use layout::SystemLayout;
pub use mode::{Mode, Sequence};
