//! Error taxonomy for machine lifecycle operations.
//!
//! Every fallible operation in machined returns [`MachinedResult`]. Variants map
//! onto the recovery policy callers apply:
//!
//! - `Precondition` / `Busy`: surfaced immediately, never retried
//! - `Errno` carrying `EBUSY`/`EAGAIN`/`ENOENT`: retried by the component
//! - `Corrupted`: the redundant copy is tried before surfacing
//! - `TaskPanic`: a task unwound; treated like any other task failure
//! - `Phase`: all task failures of one phase, aggregated

use std::fmt;

use nix::errno::Errno;

/// Result alias used across machined.
pub type MachinedResult<T> = Result<T, MachinedError>;

#[derive(Debug, thiserror::Error)]
pub enum MachinedError {
    /// Operation is not allowed in the current state (wrong mode, already installed, ...).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Another lifecycle sequence holds the sequencer lock.
    #[error("another lifecycle sequence is already running")]
    Busy,

    /// On-disk structure failed magic or checksum validation on every copy.
    #[error("corrupted data: {0}")]
    Corrupted(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The META partition does not exist on this machine.
    #[error("no META partition")]
    NoMetaPartition,

    /// A task panicked; the formatted backtrace is kept for diagnostics.
    #[error("task {task:?} panicked: {message}\n{backtrace}")]
    TaskPanic {
        task: String,
        message: String,
        backtrace: String,
    },

    /// One or more tasks of a phase failed.
    #[error("phase {phase:?} failed:\n{errors}")]
    Phase { phase: String, errors: MultiError },

    #[error("mount error: {0}")]
    Mount(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Errno(#[from] Errno),
}

impl MachinedError {
    /// Whether this error reports a concurrent lifecycle sequence.
    pub fn is_busy(&self) -> bool {
        matches!(self, MachinedError::Busy)
    }

    /// Whether this error means "absent" rather than "broken".
    pub fn is_not_found(&self) -> bool {
        match self {
            MachinedError::NotFound(_) | MachinedError::NoMetaPartition => true,
            MachinedError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            MachinedError::Errno(errno) => *errno == Errno::ENOENT,
            _ => false,
        }
    }

    /// Raw errno carried by this error, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            MachinedError::Errno(errno) => Some(*errno),
            MachinedError::Io(e) => e.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }

    /// Convert lifecycle `Busy` into the precondition failure reported to API callers.
    pub fn into_precondition(self) -> Self {
        match self {
            MachinedError::Busy => {
                MachinedError::Precondition("another lifecycle sequence is running".into())
            }
            other => other,
        }
    }
}

/// Aggregated errors of concurrently executed tasks.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<MachinedError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: MachinedError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[MachinedError] {
        &self.errors
    }

    /// `Ok(())` when nothing was collected, otherwise the aggregate.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

impl FromIterator<MachinedError> for MultiError {
    fn from_iter<I: IntoIterator<Item = MachinedError>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}
