//! Interfaces to the subsystems the lifecycle sequences drive but do not own.
//!
//! Service supervision, network configuration and cluster membership live
//! outside this crate. Sequences reach them only through these traits.

use crate::cmdline::Cmdline;
use crate::config::{InstallConfig, MachineConfig};
use crate::constants::{cmdline as keys, timeouts};
use crate::installer::Installer;
use crate::runtime::{Mode, Sequence};
use crate::util::blocking;
use crate::util::retry::{Retry, expected, unexpected};
use async_trait::async_trait;
use machined_shared::{MachinedError, MachinedResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// ============================================================================
// PLATFORM
// ============================================================================

/// Where the machine runs and where its configuration comes from.
#[async_trait]
pub trait Platform: Send + Sync {
    fn name(&self) -> &str;

    fn mode(&self) -> Mode;

    /// Raw machine configuration, possibly gzip-compressed.
    async fn configuration(&self) -> MachinedResult<Vec<u8>>;

    /// Extra kernel arguments for installed boot entries.
    fn kernel_args(&self) -> Vec<String> {
        Vec::new()
    }

    /// Platform-specific setup once stage-1 services are up.
    async fn initialize(&self) -> MachinedResult<()> {
        Ok(())
    }
}

/// Retrieves a configuration document by URL.
#[async_trait]
pub trait ConfigFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> MachinedResult<Vec<u8>>;
}

/// Reads `file://` URLs and absolute paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFetcher;

#[async_trait]
impl ConfigFetcher for LocalFetcher {
    async fn fetch(&self, url: &str) -> MachinedResult<Vec<u8>> {
        let path = match url.strip_prefix("file://") {
            Some(path) => PathBuf::from(path),
            None if url.starts_with('/') => PathBuf::from(url),
            None => {
                return Err(MachinedError::Unsupported(format!(
                    "cannot fetch {} without a network fetcher",
                    url
                )));
            }
        };
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MachinedError::NotFound(format!("config {}", path.display()))
            } else {
                MachinedError::Io(e)
            }
        })
    }
}

/// Bare metal: configuration from the `talos.config` URL.
pub struct Metal {
    config_url: Option<String>,
    fetcher: Arc<dyn ConfigFetcher>,
}

impl Metal {
    pub fn new(config_url: Option<String>, fetcher: Arc<dyn ConfigFetcher>) -> Self {
        Self {
            config_url,
            fetcher,
        }
    }
}

#[async_trait]
impl Platform for Metal {
    fn name(&self) -> &str {
        "metal"
    }

    fn mode(&self) -> Mode {
        Mode::Metal
    }

    async fn configuration(&self) -> MachinedResult<Vec<u8>> {
        let url = self.config_url.as_deref().ok_or_else(|| {
            MachinedError::Config(format!("no config source: {} is not set", keys::CONFIG))
        })?;
        info!(url, "Fetching machine config");
        self.fetcher.fetch(url).await
    }

    fn kernel_args(&self) -> Vec<String> {
        vec!["console=tty0".to_string(), "console=ttyS0".to_string()]
    }
}

/// Running as a container: configuration passed in the `USERDATA`
/// environment variable.
#[derive(Debug, Default, Clone, Copy)]
pub struct Container;

pub const USERDATA_ENV: &str = "USERDATA";

#[async_trait]
impl Platform for Container {
    fn name(&self) -> &str {
        "container"
    }

    fn mode(&self) -> Mode {
        Mode::Container
    }

    async fn configuration(&self) -> MachinedResult<Vec<u8>> {
        std::env::var(USERDATA_ENV)
            .map(String::into_bytes)
            .map_err(|_| MachinedError::Config(format!("{} is not set", USERDATA_ENV)))
    }
}

/// Platform named on the kernel command line.
pub fn platform_for(cmdline: &Cmdline) -> MachinedResult<Arc<dyn Platform>> {
    let name = cmdline.platform().ok_or_else(|| {
        MachinedError::Precondition(format!("{} is not set", keys::PLATFORM))
    })?;

    match name.as_str() {
        "metal" => Ok(Arc::new(Metal::new(
            cmdline.config_url().map(str::to_string),
            Arc::new(LocalFetcher),
        ))),
        "container" => Ok(Arc::new(Container)),
        other => Err(MachinedError::Unsupported(format!("platform {}", other))),
    }
}

// ============================================================================
// SERVICES, NETWORK, CLUSTER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Up,
    Finished,
    Down,
}

/// System service supervisor.
#[async_trait]
pub trait SystemServices: Send + Sync {
    async fn start(&self, services: &[&str]) -> MachinedResult<()>;

    /// Wait for every service in `services` to reach `state`.
    async fn wait_for(
        &self,
        services: &[&str],
        state: ServiceState,
        timeout: Duration,
    ) -> MachinedResult<()>;

    async fn stop(&self, services: &[&str]) -> MachinedResult<()>;

    async fn stop_all(&self) -> MachinedResult<()>;
}

#[async_trait]
pub trait NetworkConfigurator: Send + Sync {
    /// Bring up interfaces with DHCP so the configuration can be fetched.
    async fn setup_discovery(&self) -> MachinedResult<()>;

    async fn reset(&self) -> MachinedResult<()>;

    async fn configure(&self, config: &MachineConfig) -> MachinedResult<()>;
}

#[async_trait]
pub trait ClusterOperations: Send + Sync {
    async fn cordon_and_drain(&self) -> MachinedResult<()>;

    /// Leave the etcd cluster. `preserve` keeps the member data.
    async fn leave_etcd(&self, preserve: bool) -> MachinedResult<()>;

    async fn remove_all_pods(&self) -> MachinedResult<()>;

    async fn label_node_as_master(&self) -> MachinedResult<()>;
}

/// Used when the machine runs without a service supervisor, network daemon
/// or cluster: every call succeeds after logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unmanaged;

#[async_trait]
impl SystemServices for Unmanaged {
    async fn start(&self, services: &[&str]) -> MachinedResult<()> {
        debug!(?services, "Unmanaged: start");
        Ok(())
    }

    async fn wait_for(&self, services: &[&str], state: ServiceState, _timeout: Duration) -> MachinedResult<()> {
        debug!(?services, ?state, "Unmanaged: wait");
        Ok(())
    }

    async fn stop(&self, services: &[&str]) -> MachinedResult<()> {
        debug!(?services, "Unmanaged: stop");
        Ok(())
    }

    async fn stop_all(&self) -> MachinedResult<()> {
        debug!("Unmanaged: stop all");
        Ok(())
    }
}

#[async_trait]
impl NetworkConfigurator for Unmanaged {
    async fn setup_discovery(&self) -> MachinedResult<()> {
        Ok(())
    }

    async fn reset(&self) -> MachinedResult<()> {
        Ok(())
    }

    async fn configure(&self, _config: &MachineConfig) -> MachinedResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ClusterOperations for Unmanaged {
    async fn cordon_and_drain(&self) -> MachinedResult<()> {
        Ok(())
    }

    async fn leave_etcd(&self, preserve: bool) -> MachinedResult<()> {
        debug!(preserve, "Unmanaged: leave etcd");
        Ok(())
    }

    async fn remove_all_pods(&self) -> MachinedResult<()> {
        Ok(())
    }

    async fn label_node_as_master(&self) -> MachinedResult<()> {
        Ok(())
    }
}

// ============================================================================
// INSTALLER
// ============================================================================

/// Fetches installer images.
#[async_trait]
pub trait ImagePuller: Send + Sync {
    async fn pull(&self, image: &str) -> MachinedResult<()>;
}

/// Pull `image`, retrying transient failures. A missing image fails at once.
pub async fn pull_with_retry(puller: &dyn ImagePuller, image: &str) -> MachinedResult<()> {
    pull_with_policy(
        puller,
        image,
        Retry::exponential(timeouts::IMAGE_PULL, timeouts::IMAGE_PULL_BASE),
    )
    .await
}

pub async fn pull_with_policy(puller: &dyn ImagePuller, image: &str, retry: Retry) -> MachinedResult<()> {
    retry
        .retry_async(move || async move {
            match puller.pull(image).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Err(unexpected(e)),
                Err(e) => Err(expected(e)),
            }
        })
        .await
}

/// Runs the installer for Install and Upgrade sequences.
#[async_trait]
pub trait InstallerRunner: Send + Sync {
    /// `pull` fetches `config.image` first.
    async fn run(&self, config: &InstallConfig, sequence: Sequence, pull: bool) -> MachinedResult<()>;
}

/// Installs from the assets shipped in the running image.
pub struct InProcessInstaller {
    installer: Arc<Installer>,
    puller: Option<Arc<dyn ImagePuller>>,
}

impl InProcessInstaller {
    pub fn new(installer: Installer) -> Self {
        Self {
            installer: Arc::new(installer),
            puller: None,
        }
    }

    pub fn with_puller(mut self, puller: Arc<dyn ImagePuller>) -> Self {
        self.puller = Some(puller);
        self
    }
}

#[async_trait]
impl InstallerRunner for InProcessInstaller {
    async fn run(&self, config: &InstallConfig, sequence: Sequence, pull: bool) -> MachinedResult<()> {
        if pull && let Some(image) = config.image.as_deref() {
            let puller = self.puller.as_ref().ok_or_else(|| {
                MachinedError::Unsupported(format!("cannot pull {}: no image puller", image))
            })?;
            info!(image, "Pulling installer image");
            pull_with_retry(puller.as_ref(), image).await?;
        }

        let installer = self.installer.clone();
        let config = config.clone();
        let report = blocking(move || installer.install(&config, sequence)).await?;
        info!(label = %report.label, upgraded = report.upgraded, "Installer finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyPuller {
        attempts: AtomicU32,
        fail_times: u32,
        missing: bool,
    }

    #[async_trait]
    impl ImagePuller for FlakyPuller {
        async fn pull(&self, image: &str) -> MachinedResult<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.missing {
                return Err(MachinedError::NotFound(image.to_string()));
            }
            if n < self.fail_times {
                return Err(MachinedError::Internal("registry unavailable".into()));
            }
            Ok(())
        }
    }

    fn fast() -> Retry {
        Retry::exponential(Duration::from_secs(2), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_pull_retries_transient_errors() {
        let puller = FlakyPuller {
            attempts: AtomicU32::new(0),
            fail_times: 2,
            missing: false,
        };
        pull_with_policy(&puller, "installer:v1", fast()).await.unwrap();
        assert_eq!(puller.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_pull_aborts_on_not_found() {
        let puller = FlakyPuller {
            attempts: AtomicU32::new(0),
            fail_times: 0,
            missing: true,
        };
        let err = pull_with_policy(&puller, "installer:v1", fast())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(puller.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_fetcher() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"{}").unwrap();
        let url = format!("file://{}", file.path().display());

        assert_eq!(LocalFetcher.fetch(&url).await.unwrap(), b"{}");
        assert!(
            LocalFetcher
                .fetch("https://example/config")
                .await
                .is_err()
        );
        assert!(
            LocalFetcher
                .fetch("/nonexistent/config")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_platform_from_cmdline() {
        let cmdline = Cmdline::parse("talos.platform=metal talos.config=file:///tmp/none");
        let platform = platform_for(&cmdline).unwrap();
        assert_eq!(platform.name(), "metal");
        assert_eq!(platform.mode(), Mode::Metal);

        let unsupported = Cmdline::parse("talos.platform=aws");
        assert!(matches!(
            platform_for(&unsupported),
            Err(MachinedError::Unsupported(_))
        ));
    }
}
