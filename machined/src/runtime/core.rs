//! Process-wide runtime shared by every lifecycle task.

use super::collaborators::{
    ClusterOperations, InProcessInstaller, InstallerRunner, NetworkConfigurator, Platform,
    SystemServices, Unmanaged,
};
use super::layout::SystemLayout;
use super::mode::Mode;
use crate::cmdline::Cmdline;
use crate::config::MachineConfig;
use crate::events::EventBus;
use crate::installer::{DiskOps, HostDisks, InstallOptions, Installer};
use crate::meta::Meta;
use crate::mount::point::Point;
use crate::mount::points::Points;
use crate::resources::State;
use crate::util::process::{CommandRunner, SystemCommandRunner};
use machined_shared::{MachinedError, MachinedResult};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Trait objects for the subsystems sequences drive but do not own.
#[derive(Clone)]
pub struct Collaborators {
    pub services: Arc<dyn SystemServices>,
    pub network: Arc<dyn NetworkConfigurator>,
    pub cluster: Arc<dyn ClusterOperations>,
    pub installer: Arc<dyn InstallerRunner>,
    pub disks: Arc<dyn DiskOps>,
    /// Partitioning and formatting tools.
    pub commands: Arc<dyn CommandRunner>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            services: Arc::new(Unmanaged),
            network: Arc::new(Unmanaged),
            cluster: Arc::new(Unmanaged),
            installer: Arc::new(InProcessInstaller::new(Installer::new(
                InstallOptions::default(),
            ))),
            disks: Arc::new(HostDisks::default()),
            commands: Arc::new(SystemCommandRunner),
        }
    }
}

// ============================================================================
// PUBLIC API
// ============================================================================

/// Handle to the machine runtime.
///
/// **Cloning**: cheap, all clones share the same state.
///
/// **Locking Strategy**:
/// - `config` and `meta` are behind `RwLock`s and read far more often than
///   written (once per boot)
/// - `system_points` is a `Mutex`; mount tasks register points and unmount
///   tasks take them back
/// - everything else is immutable after [`RuntimeBuilder::build`]
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    mode: Mode,
    platform: Arc<dyn Platform>,
    cmdline: Cmdline,
    layout: SystemLayout,
    state: Arc<State>,
    events: Arc<EventBus>,
    collaborators: Collaborators,

    config: RwLock<Option<MachineConfig>>,
    meta: RwLock<Option<Meta>>,
    /// Owned partitions currently mounted (boot, ephemeral, user disks).
    system_points: Mutex<Points>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("mode", &self.inner.mode)
            .field("platform", &self.inner.platform.name())
            .field("root", &self.inner.layout.root())
            .finish()
    }
}

/// Builds a [`Runtime`].
///
/// # Example
///
/// ```ignore
/// let runtime = Runtime::builder(platform, Cmdline::read()?)
///     .collaborators(collaborators)
///     .build();
/// ```
pub struct RuntimeBuilder {
    platform: Arc<dyn Platform>,
    cmdline: Cmdline,
    layout: SystemLayout,
    state: Option<Arc<State>>,
    events: Option<Arc<EventBus>>,
    collaborators: Option<Collaborators>,
}

impl RuntimeBuilder {
    pub fn layout(mut self, layout: SystemLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn state(mut self, state: Arc<State>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    pub fn build(self) -> Runtime {
        let mode = self.platform.mode();
        tracing::debug!(platform = self.platform.name(), %mode, "Runtime created");

        Runtime {
            inner: Arc::new(RuntimeInner {
                mode,
                platform: self.platform,
                cmdline: self.cmdline,
                layout: self.layout,
                state: self.state.unwrap_or_default(),
                events: self.events.unwrap_or_default(),
                collaborators: self.collaborators.unwrap_or_default(),
                config: RwLock::new(None),
                meta: RwLock::new(None),
                system_points: Mutex::new(Points::new()),
            }),
        }
    }
}

// ============================================================================
// RUNTIME IMPLEMENTATION
// ============================================================================

impl Runtime {
    pub fn builder(platform: Arc<dyn Platform>, cmdline: Cmdline) -> RuntimeBuilder {
        RuntimeBuilder {
            platform,
            cmdline,
            layout: SystemLayout::default(),
            state: None,
            events: None,
            collaborators: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.inner.platform
    }

    pub fn cmdline(&self) -> &Cmdline {
        &self.inner.cmdline
    }

    pub fn layout(&self) -> &SystemLayout {
        &self.inner.layout
    }

    pub fn state(&self) -> &Arc<State> {
        &self.inner.state
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn services(&self) -> &Arc<dyn SystemServices> {
        &self.inner.collaborators.services
    }

    pub fn network(&self) -> &Arc<dyn NetworkConfigurator> {
        &self.inner.collaborators.network
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterOperations> {
        &self.inner.collaborators.cluster
    }

    pub fn installer(&self) -> &Arc<dyn InstallerRunner> {
        &self.inner.collaborators.installer
    }

    pub fn disks(&self) -> &Arc<dyn DiskOps> {
        &self.inner.collaborators.disks
    }

    pub fn commands(&self) -> &Arc<dyn CommandRunner> {
        &self.inner.collaborators.commands
    }

    // ========================================================================
    // MACHINE CONFIG
    // ========================================================================

    /// The loaded configuration. Fails before the config phase has run.
    pub fn config(&self) -> MachinedResult<MachineConfig> {
        self.try_config().ok_or_else(|| {
            MachinedError::Precondition("machine config is not loaded".to_string())
        })
    }

    pub fn try_config(&self) -> Option<MachineConfig> {
        self.inner.config.read().clone()
    }

    pub fn set_config(&self, config: MachineConfig) {
        *self.inner.config.write() = Some(config);
    }

    pub fn is_control_plane(&self) -> bool {
        self.inner
            .config
            .read()
            .as_ref()
            .is_some_and(|c| c.machine.machine_type.is_control_plane())
    }

    /// Install disk named by the configuration.
    pub fn system_disk(&self) -> Option<String> {
        self.inner
            .config
            .read()
            .as_ref()
            .and_then(|c| c.machine.install.disk.clone())
    }

    // ========================================================================
    // META
    // ========================================================================

    pub fn meta(&self) -> Option<Meta> {
        self.inner.meta.read().clone()
    }

    pub fn set_meta(&self, meta: Meta) {
        *self.inner.meta.write() = Some(meta);
    }

    // ========================================================================
    // OWNED MOUNTS
    // ========================================================================

    /// Record mounted system partitions so later sequences can unmount them.
    pub fn register_system_points(&self, points: Points) -> MachinedResult<()> {
        self.inner.system_points.lock().extend(points)
    }

    /// Remove and return the registered point under `key`.
    pub fn take_system_point(&self, key: &str) -> Option<Point> {
        self.inner.system_points.lock().remove(key)
    }

    /// Mount targets of every registered point.
    pub fn owned_targets(&self) -> Vec<String> {
        self.inner
            .system_points
            .lock()
            .iter()
            .map(|(_, point)| point.target())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstallConfig, MachineSection, MachineType};
    use crate::runtime::collaborators::Container;
    use nix::mount::MsFlags;

    fn runtime() -> Runtime {
        Runtime::builder(Arc::new(Container), Cmdline::parse("")).build()
    }

    fn config(machine_type: MachineType) -> MachineConfig {
        MachineConfig {
            debug: false,
            persist: true,
            machine: MachineSection {
                machine_type,
                install: InstallConfig {
                    disk: Some("/dev/vda".to_string()),
                    ..InstallConfig::default()
                },
                disks: Vec::new(),
                env: Default::default(),
                files: Vec::new(),
                sysctls: Default::default(),
            },
        }
    }

    #[test]
    fn test_mode_comes_from_platform() {
        assert_eq!(runtime().mode(), Mode::Container);
    }

    #[test]
    fn test_config_slot() {
        let runtime = runtime();
        assert!(matches!(
            runtime.config().unwrap_err(),
            MachinedError::Precondition(_)
        ));
        assert!(!runtime.is_control_plane());

        runtime.set_config(config(MachineType::ControlPlane));
        assert!(runtime.is_control_plane());
        assert_eq!(runtime.system_disk().as_deref(), Some("/dev/vda"));

        // Clones share the slot.
        let clone = runtime.clone();
        clone.set_config(config(MachineType::Worker));
        assert!(!runtime.is_control_plane());
    }

    #[test]
    fn test_system_points_registry() {
        let runtime = runtime();
        let mut points = Points::new();
        points
            .set(
                "boot",
                Point::new("/dev/vda3", "/boot", "xfs", MsFlags::empty(), ""),
            )
            .unwrap();
        runtime.register_system_points(points).unwrap();

        assert_eq!(runtime.owned_targets(), vec!["/boot".to_string()]);
        assert!(runtime.take_system_point("boot").is_some());
        assert!(runtime.take_system_point("boot").is_none());
        assert!(runtime.owned_targets().is_empty());
    }
}
