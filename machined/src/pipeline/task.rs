//! Task trait for phase execution.

use crate::runtime::Mode;
use async_trait::async_trait;
use machined_shared::MachinedResult;

/// A unit of work inside a phase.
///
/// Tasks of one phase run concurrently against a shared context, which is
/// cloned per task.
#[async_trait]
pub trait PhaseTask<Ctx>: Send + Sync {
    /// Human-readable task name for logging.
    fn name(&self) -> &str;

    /// Whether the task applies in `mode`. Tasks that don't are skipped
    /// silently.
    fn supports(&self, _mode: Mode) -> bool {
        true
    }

    /// Execute the task.
    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()>;
}

pub type BoxedTask<Ctx> = Box<dyn PhaseTask<Ctx>>;
