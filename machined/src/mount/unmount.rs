//! Unmount helpers that cannot hang a lifecycle sequence.

use crate::constants::timeouts;
use machined_shared::{MachinedError, MachinedResult};
use nix::errno::Errno;
use nix::mount::{MntFlags, umount2};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Unmount `target` lazily, escalating to a forced unmount if the lazy
/// attempt has not returned within its timeout.
pub fn safe_unmount(target: impl AsRef<Path>) -> MachinedResult<()> {
    let target = target.as_ref();

    if let Some(result) = unmount_with_timeout(target, MntFlags::MNT_DETACH, timeouts::LAZY_UNMOUNT)
    {
        return result;
    }

    tracing::warn!(target = %target.display(), "Unmount timed out, forcing");

    match unmount_with_timeout(target, MntFlags::MNT_FORCE, timeouts::FORCE_UNMOUNT) {
        Some(result) => result,
        None => Err(MachinedError::Timeout(format!(
            "forced unmount of {} did not complete",
            target.display()
        ))),
    }
}

/// Run `umount2` on a helper thread and wait up to `timeout`.
///
/// Returns `None` if the call did not finish in time. Progress is logged
/// every fifth of the timeout.
pub fn unmount_with_timeout(
    target: &Path,
    flags: MntFlags,
    timeout: Duration,
) -> Option<MachinedResult<()>> {
    let (tx, rx) = mpsc::channel::<Result<(), Errno>>();
    let owned: PathBuf = target.to_path_buf();

    std::thread::spawn(move || {
        let _ = tx.send(umount2(&owned, flags));
    });

    let tick = timeout / 5;
    let start = Instant::now();

    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return None;
        }

        match rx.recv_timeout(tick.min(remaining)) {
            Ok(result) => return Some(result.map_err(MachinedError::Errno)),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::info!(
                    target = %target.display(),
                    elapsed_secs = start.elapsed().as_secs(),
                    "Still waiting for unmount"
                );
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Some(Err(MachinedError::Internal(
                    "unmount thread exited without a result".to_string(),
                )));
            }
        }
    }
}
