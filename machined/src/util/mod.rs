pub mod power;
pub mod process;
pub mod retry;

use machined_shared::{MachinedError, MachinedResult};

/// Run a blocking closure on the blocking thread pool.
///
/// Every syscall that may park the thread (mount, ioctl, flock, netlink
/// recv) goes through here so concurrent phase tasks are never starved.
pub async fn blocking<T, F>(f: F) -> MachinedResult<T>
where
    F: FnOnce() -> MachinedResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        // Re-raise so the phase runner reports it as a task panic.
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(MachinedError::Internal(format!("blocking task failed: {}", e))),
    }
}
