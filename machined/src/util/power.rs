//! Final power transitions of PID 1.

use machined_shared::MachinedResult;
use nix::sys::reboot::{RebootMode, reboot};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Reboot,
    PowerOff,
    Halt,
}

impl PowerAction {
    /// Action after a shutdown request: `talos.shutdown=halt` halts,
    /// anything else powers off.
    pub fn for_shutdown(mode: Option<&str>) -> Self {
        match mode {
            Some("halt") => PowerAction::Halt,
            _ => PowerAction::PowerOff,
        }
    }

    fn mode(self) -> RebootMode {
        match self {
            PowerAction::Reboot => RebootMode::RB_AUTOBOOT,
            PowerAction::PowerOff => RebootMode::RB_POWER_OFF,
            PowerAction::Halt => RebootMode::RB_HALT_SYSTEM,
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerAction::Reboot => "reboot",
            PowerAction::PowerOff => "poweroff",
            PowerAction::Halt => "halt",
        };
        f.write_str(name)
    }
}

/// Flush filesystems and perform `action`. Only returns on failure.
pub fn perform(action: PowerAction) -> MachinedResult<()> {
    warn!(%action, "Performing power action");
    nix::unistd::sync();
    match reboot(action.mode()) {
        Ok(never) => match never {},
        Err(errno) => Err(errno.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_action() {
        assert_eq!(PowerAction::for_shutdown(Some("halt")), PowerAction::Halt);
        assert_eq!(PowerAction::for_shutdown(Some("poweroff")), PowerAction::PowerOff);
        assert_eq!(PowerAction::for_shutdown(None), PowerAction::PowerOff);
    }
}
