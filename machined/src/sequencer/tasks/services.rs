//! Tasks: services, network and platform hooks.

use super::{Ctx, log_task_error};
use crate::constants::timeouts;
use crate::events::acpi;
use crate::pipeline::PhaseTask;
use crate::runtime::{Mode, ServiceState};
use async_trait::async_trait;
use machined_shared::MachinedResult;
use tracing::{info, warn};

const STAGE1_SERVICES: &[&str] = &["apid", "routerd", "containerd", "networkd"];
const UPGRADE_STOPPED_SERVICES: &[&str] = &["containerd", "udevd"];

fn stage2_services(mode: Mode) -> &'static [&'static str] {
    if mode.is_container() {
        &["timed"]
    } else {
        &["timed", "udevd", "udevd-trigger"]
    }
}

// ============================================================================
// NETWORK
// ============================================================================

pub struct SetupDiscoveryNetwork;

#[async_trait]
impl PhaseTask<Ctx> for SetupDiscoveryNetwork {
    fn name(&self) -> &str {
        "setup_discovery_network"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        if ctx.cmdline().has_static_ip() {
            info!("Static addressing on the kernel command line, skipping discovery");
            return Ok(());
        }
        ctx.network().setup_discovery().await
    }
}

pub struct ResetNetwork;

#[async_trait]
impl PhaseTask<Ctx> for ResetNetwork {
    fn name(&self) -> &str {
        "reset_network"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let config = ctx.config()?;
        ctx.network().reset().await?;
        ctx.network().configure(&config).await
    }
}

// ============================================================================
// SERVICES
// ============================================================================

pub struct StartStage1Services;

#[async_trait]
impl PhaseTask<Ctx> for StartStage1Services {
    fn name(&self) -> &str {
        "start_stage1_services"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let services = ctx.services();
        services.start(STAGE1_SERVICES).await?;
        services
            .wait_for(STAGE1_SERVICES, ServiceState::Up, timeouts::SERVICE_BARRIER)
            .await
            .inspect_err(|e| log_task_error(self.name(), e))
    }
}

pub struct StartStage2Services;

#[async_trait]
impl PhaseTask<Ctx> for StartStage2Services {
    fn name(&self) -> &str {
        "start_stage2_services"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let all = stage2_services(ctx.mode());
        let (oneshot, daemons): (Vec<&str>, Vec<&str>) =
            all.iter().copied().partition(|s| s.ends_with("-trigger"));

        let services = ctx.services();
        services.start(all).await?;
        services
            .wait_for(&daemons, ServiceState::Up, timeouts::SERVICE_BARRIER)
            .await?;
        if !oneshot.is_empty() {
            services
                .wait_for(&oneshot, ServiceState::Finished, timeouts::SERVICE_BARRIER)
                .await?;
        }
        Ok(())
    }
}

pub struct StopAllServices;

#[async_trait]
impl PhaseTask<Ctx> for StopAllServices {
    fn name(&self) -> &str {
        "stop_all_services"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        ctx.services().stop_all().await
    }
}

pub struct StopServicesForUpgrade;

#[async_trait]
impl PhaseTask<Ctx> for StopServicesForUpgrade {
    fn name(&self) -> &str {
        "stop_services_for_upgrade"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        ctx.services().stop(UPGRADE_STOPPED_SERVICES).await
    }
}

// ============================================================================
// PLATFORM AND EVENTS
// ============================================================================

pub struct InitializePlatform;

#[async_trait]
impl PhaseTask<Ctx> for InitializePlatform {
    fn name(&self) -> &str {
        "initialize_platform"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        ctx.platform().initialize().await
    }
}

/// Starts the power button listener in the background.
pub struct StartAcpiWatcher;

#[async_trait]
impl PhaseTask<Ctx> for StartAcpiWatcher {
    fn name(&self) -> &str {
        "start_acpi_watcher"
    }

    fn supports(&self, mode: Mode) -> bool {
        !mode.is_container()
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let bus = ctx.events().clone();
        tokio::spawn(async move {
            if let Err(e) = acpi::watch(bus).await {
                warn!(error = %e, "ACPI watcher stopped");
            }
        });
        Ok(())
    }
}
