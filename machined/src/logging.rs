//! Tracing subscriber setup.

use crate::kmsg::KmsgWriter;
use machined_shared::{MachinedError, MachinedResult};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Where log lines go.
#[derive(Debug, Clone)]
pub enum LogTarget {
    Stderr,
    /// Kernel log; every line is prefixed, e.g. `[machined]`.
    Kmsg { path: PathBuf, prefix: String },
}

/// Keeps the background log writer alive. Dropping it flushes pending lines.
#[must_use]
#[derive(Debug)]
pub struct LoggingGuard {
    _worker: Option<WorkerGuard>,
}

/// `RUST_LOG` when set, otherwise `info`.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(target: LogTarget) -> MachinedResult<LoggingGuard> {
    match target {
        LogTarget::Stderr => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(std::io::stderr)
                .with_target(false)
                .try_init()
                .map_err(|e| MachinedError::Internal(format!("failed to init logging: {}", e)))?;
            Ok(LoggingGuard { _worker: None })
        }
        LogTarget::Kmsg { path, prefix } => {
            let writer = KmsgWriter::open(&path, &prefix)?;
            let (non_blocking, worker) = tracing_appender::non_blocking(writer);

            // The kernel stamps every record; no local clock or colors.
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .without_time()
                .try_init()
                .map_err(|e| MachinedError::Internal(format!("failed to init logging: {}", e)))?;
            Ok(LoggingGuard {
                _worker: Some(worker),
            })
        }
    }
}
