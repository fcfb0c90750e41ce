//! Phase pipeline execution.
//!
//! Phases run strictly in order. Every applicable task of a phase is spawned
//! before any result is collected, so tasks run concurrently and none
//! blocks another. All task failures of a phase are aggregated; a failed
//! phase stops the pipeline.

use super::metrics::{PhaseRecord, PipelineMetrics, TaskOutcome, TaskRecord};
use super::panic::catch_task_panic;
use super::phase::Phase;
use super::task::BoxedTask;
use crate::runtime::Mode;
use machined_shared::{MachinedError, MachinedResult, MultiError};
use std::time::Instant;
use tracing::{debug, error, info};

/// Ordered list of phases.
pub struct Pipeline<Ctx> {
    phases: Vec<Phase<Ctx>>,
}

impl<Ctx> Default for Pipeline<Ctx> {
    fn default() -> Self {
        Self { phases: Vec::new() }
    }
}

impl<Ctx> Pipeline<Ctx> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a phase.
    pub fn register_phase(&mut self, description: impl Into<String>, tasks: Vec<BoxedTask<Ctx>>) {
        self.phases.push(Phase::new(description, tasks));
    }

    /// Builder form of [`Pipeline::register_phase`].
    pub fn phase(mut self, description: impl Into<String>, tasks: Vec<BoxedTask<Ctx>>) -> Self {
        self.register_phase(description, tasks);
        self
    }

    pub fn phases(&self) -> &[Phase<Ctx>] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Run every phase of `pipeline` with tasks resolved for `mode`.
    pub async fn execute<Ctx>(
        pipeline: Pipeline<Ctx>,
        ctx: Ctx,
        mode: Mode,
    ) -> MachinedResult<PipelineMetrics>
    where
        Ctx: Clone + Send + 'static,
    {
        let total_start = Instant::now();
        let mut phase_records = Vec::new();
        let count = pipeline.phases.len();

        for (index, phase) in pipeline.phases.into_iter().enumerate() {
            let Phase { description, tasks } = phase;
            let phase_start = Instant::now();

            info!(phase = %description, "Phase {}/{} started", index + 1, count);

            // One slot per task in registration order; `None` when not applicable.
            let mut slots = Vec::with_capacity(tasks.len());
            for task in tasks {
                let name = task.name().to_string();
                if !task.supports(mode) {
                    debug!(phase = %description, task = %name, %mode, "Task not applicable");
                    slots.push((name, None));
                    continue;
                }

                let task_ctx = ctx.clone();
                let task_name = name.clone();
                let handle = tokio::spawn(async move {
                    let start = Instant::now();
                    let result = catch_task_panic(&task_name, task.run(task_ctx)).await;
                    (result, start.elapsed().as_millis())
                });
                slots.push((name, Some(handle)));
            }

            let mut errors = MultiError::new();
            let mut task_records = Vec::with_capacity(slots.len());

            for (name, handle) in slots {
                let Some(handle) = handle else {
                    task_records.push(TaskRecord {
                        name,
                        outcome: TaskOutcome::NotApplicable,
                    });
                    continue;
                };

                match handle.await {
                    Ok((Ok(()), duration_ms)) => {
                        debug!(phase = %description, task = %name, duration_ms, "Task done");
                        task_records.push(TaskRecord {
                            name,
                            outcome: TaskOutcome::Completed { duration_ms },
                        });
                    }
                    Ok((Err(e), _)) => {
                        error!(phase = %description, task = %name, error = %e, "Task failed");
                        errors.push(e);
                    }
                    Err(e) => {
                        error!(phase = %description, task = %name, error = %e, "Task aborted");
                        errors.push(MachinedError::Internal(format!(
                            "task {} aborted: {}",
                            name, e
                        )));
                    }
                }
            }

            if let Err(errors) = errors.into_result() {
                error!(phase = %description, "Phase {}/{} failed", index + 1, count);
                return Err(MachinedError::Phase {
                    phase: description,
                    errors,
                });
            }

            let duration_ms = phase_start.elapsed().as_millis();
            info!(phase = %description, duration_ms, "Phase {}/{} done", index + 1, count);

            phase_records.push(PhaseRecord {
                index,
                description,
                duration_ms,
                tasks: task_records,
            });
        }

        Ok(PipelineMetrics {
            mode,
            total_duration_ms: total_start.elapsed().as_millis(),
            phases: phase_records,
        })
    }
}
