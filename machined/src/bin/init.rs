//! Initramfs PID 1: mount the pseudo filesystems and the squashfs root,
//! then switch into it.

use anyhow::{Context, Result};
use machined::constants::{paths, timeouts, version};
use machined::logging::{LogTarget, LoggingGuard, init_logging};
use machined::mount::loopdev::LoopDevice;
use machined::mount::switch_root::switch_root;
use machined::mount::{mount_all, sets};
use machined::util::power::{PowerAction, perform};
use std::path::PathBuf;
use tracing::{error, info};

fn init_kmsg_logging() -> Option<LoggingGuard> {
    let target = LogTarget::Kmsg {
        path: PathBuf::from(paths::KMSG),
        prefix: "[init]".to_string(),
    };
    match init_logging(target).or_else(|_| init_logging(LogTarget::Stderr)) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("init: logging unavailable: {}", e);
            None
        }
    }
}

fn run(logging: &mut Option<LoggingGuard>) -> Result<()> {
    let pseudo = sets::pseudo()?;
    mount_all(&pseudo).context("failed to mount pseudo filesystems")?;

    // `/dev/kmsg` exists once devtmpfs is up.
    *logging = init_kmsg_logging();
    info!(version = version::TAG, "Starting {} init", version::NAME);

    let device = LoopDevice::attach(paths::ROOTFS_IMAGE)
        .with_context(|| format!("failed to attach {}", paths::ROOTFS_IMAGE))?;
    let rootfs = sets::squashfs(paths::NEW_ROOT, &device.path().to_string_lossy())?;
    mount_all(&rootfs).context("failed to mount rootfs")?;

    info!(root = paths::NEW_ROOT, "Switching root");
    switch_root(paths::NEW_ROOT, &pseudo).context("switch root failed")?;
    Ok(())
}

fn main() {
    let mut logging = None;
    if let Err(e) = run(&mut logging) {
        error!(error = %format!("{:#}", e), "Init failed");
        eprintln!("init: {:#}", e);

        info!(delay = ?timeouts::REBOOT_DELAY, "Rebooting");
        std::thread::sleep(timeouts::REBOOT_DELAY);
        if let Err(e) = perform(PowerAction::Reboot) {
            eprintln!("init: reboot failed: {}", e);
        }
    }

    // PID 1 must never exit.
    loop {
        std::thread::park();
    }
}
