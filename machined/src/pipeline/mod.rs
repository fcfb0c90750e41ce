//! Phase pipeline: ordered phases of concurrently executed tasks.
//!
//! ## Architecture
//!
//! ```text
//! Pipeline → Phases → Tasks
//!
//! - Pipeline: runs phases one after another, stopping at the first failure
//! - Phase: a description plus tasks spawned together
//! - Task: atomic unit of work, skipped when it does not apply to the mode
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let pipeline = Pipeline::new()
//!     .phase("mount", vec![Box::new(MountPseudo)])
//!     .phase("services", vec![Box::new(StartApi), Box::new(StartUdevd)]);
//!
//! let metrics = PipelineExecutor::execute(pipeline, runtime.clone(), Mode::Metal).await?;
//! println!("boot took {}ms", metrics.total_duration_ms);
//! ```

mod metrics;
pub mod panic;
mod phase;
#[allow(clippy::module_inception)]
mod pipeline;
mod task;

pub use metrics::{PhaseRecord, PipelineMetrics, TaskOutcome, TaskRecord};
pub use phase::Phase;
pub use pipeline::{Pipeline, PipelineExecutor};
pub use task::{BoxedTask, PhaseTask};
