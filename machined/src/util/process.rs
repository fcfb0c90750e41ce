//! External command execution.
//!
//! Partitioning, formatting and bootloader installation shell out to system
//! tools. Everything goes through [`CommandRunner`] so callers can be tested
//! without touching real disks.

use machined_shared::{MachinedError, MachinedResult};
use std::process::Command;

/// Runs an external program to completion.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, returning captured stdout.
    ///
    /// A non-zero exit status is an error carrying stderr.
    fn run(&self, program: &str, args: &[String]) -> MachinedResult<String>;
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> MachinedResult<String> {
        tracing::debug!(program, args = ?args, "Running command");

        let output = Command::new(program).args(args).output().map_err(|e| {
            MachinedError::Internal(format!("failed to spawn {}: {}", program, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MachinedError::Internal(format!(
                "{} {} exited with {}: {}",
                program,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Build an owned argument vector from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Records invocations instead of running them.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingRunner {
    pub calls: parking_lot::Mutex<Vec<(String, Vec<String>)>>,
    pub fail_on: Option<String>,
}

#[cfg(test)]
impl RecordingRunner {
    pub fn failing_on(program: &str) -> Self {
        Self {
            calls: Default::default(),
            fail_on: Some(program.to_string()),
        }
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|(p, a)| format!("{} {}", p, a.join(" ")))
            .collect()
    }
}

#[cfg(test)]
impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[String]) -> MachinedResult<String> {
        self.calls.lock().push((program.to_string(), args.to_vec()));
        if self.fail_on.as_deref() == Some(program) {
            return Err(MachinedError::Internal(format!("{} failed", program)));
        }
        Ok(String::new())
    }
}
