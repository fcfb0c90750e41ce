//! Post switch-root PID 1: boots the node, then serves lifecycle events
//! until shutdown.

use anyhow::{Context, Result};
use machined::cmdline::Cmdline;
use machined::constants::{labels, paths, timeouts, version};
use machined::events::{Event, EventType, Observer};
use machined::logging::{LogTarget, LoggingGuard, init_logging};
use machined::runtime::{Runtime, platform_for};
use machined::sequencer::{LifecycleRequest, Sequencer, UpgradeOptions};
use machined::util::blocking;
use machined::util::power::{PowerAction, perform};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

fn init_kmsg_logging() -> Option<LoggingGuard> {
    let target = LogTarget::Kmsg {
        path: PathBuf::from(paths::KMSG),
        prefix: "[machined]".to_string(),
    };
    match init_logging(target).or_else(|_| init_logging(LogTarget::Stderr)) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("machined: logging unavailable: {}", e);
            None
        }
    }
}

/// Metal nodes without a boot partition have never been installed.
async fn needs_install(runtime: &Runtime) -> Result<bool> {
    if !runtime.mode().requires_install() {
        return Ok(false);
    }
    let disks = runtime.disks().clone();
    let boot = blocking(move || disks.find_by_label(labels::BOOT)).await?;
    Ok(boot.is_none())
}

async fn run(cmdline: Cmdline) -> Result<PowerAction> {
    let platform = platform_for(&cmdline).context("no usable platform")?;
    let runtime = Runtime::builder(platform, cmdline.clone()).build();
    let sequencer = Arc::new(Sequencer::new(runtime.clone()));

    let mut observer = Observer::new();
    runtime.events().register(
        &observer,
        &[EventType::Shutdown, EventType::Reboot, EventType::Upgrade],
    );

    if needs_install(&runtime).await? {
        info!("No boot partition, installing");
        sequencer.initialize().await?;
        sequencer.install().await?;
        return Ok(PowerAction::Reboot);
    }

    sequencer.boot().await?;
    info!("Boot finished");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let shutdown = PowerAction::for_shutdown(cmdline.shutdown());

    let action = loop {
        tokio::select! {
            event = observer.recv() => match event {
                Some(Event::Upgrade { image }) => {
                    let options = UpgradeOptions {
                        image: Some(image),
                        preserve: false,
                        pull: true,
                    };
                    match sequencer.handle(LifecycleRequest::Upgrade(options)).await {
                        Ok(()) => return Ok(PowerAction::Reboot),
                        Err(e) => warn!(error = %e, "Upgrade rejected"),
                    }
                }
                Some(Event::Reboot) => break PowerAction::Reboot,
                Some(Event::Shutdown) | None => break shutdown,
            },
            _ = sigterm.recv() => break shutdown,
            _ = sigint.recv() => break shutdown,
        }
    };
    runtime.events().unregister(&observer);

    info!(%action, "Shutting down");
    sequencer.shutdown().await?;
    Ok(action)
}

/// Wait out the reboot countdown, or forever when `panic=0`.
async fn on_failure(cmdline: &Cmdline) {
    if cmdline.panic_disabled() {
        error!("panic=0 set, waiting");
        std::future::pending::<()>().await;
    }

    let seconds = timeouts::REBOOT_DELAY.as_secs();
    for remaining in (1..=seconds).rev() {
        error!("Rebooting in {} seconds", remaining);
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

#[tokio::main]
async fn main() {
    let _logging = init_kmsg_logging();
    info!(version = version::TAG, "Starting {} machined", version::NAME);

    let cmdline = match Cmdline::read() {
        Ok(cmdline) => cmdline,
        Err(e) => {
            warn!(error = %e, "Failed to read kernel command line");
            Cmdline::parse("")
        }
    };

    let action = match run(cmdline.clone()).await {
        Ok(action) => action,
        Err(e) => {
            error!(error = %format!("{:#}", e), "machined failed");
            on_failure(&cmdline).await;
            PowerAction::Reboot
        }
    };

    if let Err(e) = blocking(move || perform(action)).await {
        error!(error = %e, %action, "Power action failed");
    }
    std::future::pending::<()>().await;
}
