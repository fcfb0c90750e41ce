//! Lifecycle sequencing.
//!
//! ## Architecture
//!
//! Every lifecycle call picks a table-driven execution plan and runs it
//! through the phase pipeline:
//!
//! ```text
//! Boot:
//!   1. system requirements  (kspp, sysctls, cgroups, bpffs, sub-mounts)
//!   2. integrity, etc       (IMA policy, /etc bind files)
//!   3. partitions, META     (boot + state mounts, META open)
//!   4. config, network      (load/validate config, reconfigure links)
//!   5. stage 1              (apid, routerd, containerd, networkd)
//!   6. ephemeral, overlays  (/var, overlay mounts, shared propagation)
//!   7. user config          (persist config, user disks, files, sysctls)
//!   8. stage 2              (timed, udevd, ACPI watcher)
//!   9. label master, bootloader
//!
//! Shutdown: stop services → unmount overlays/pods → unmount partitions
//! Upgrade:  leave cluster → stop → unmount → verify disk → install
//! Reset:    [leave cluster] → stop → unmount → reset system disk
//! ```
//!
//! Only one sequence runs at a time. A second caller is rejected with
//! [`MachinedError::Busy`] instead of waiting.

mod plan;
pub mod tasks;
mod types;

pub use plan::get_execution_plan;
pub use types::{LifecycleRequest, ResetOptions, UpgradeOptions};

use crate::pipeline::{Pipeline, PipelineExecutor, PipelineMetrics};
use crate::runtime::{Runtime, Sequence};
use machined_shared::{MachinedError, MachinedResult};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

/// Runs lifecycle sequences against a [`Runtime`], one at a time.
pub struct Sequencer {
    runtime: Runtime,
    lock: Mutex<()>,
}

impl Sequencer {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            lock: Mutex::new(()),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Take the lifecycle lock without waiting.
    pub fn acquire_lock(&self) -> MachinedResult<MutexGuard<'_, ()>> {
        self.lock.try_lock().map_err(|_| MachinedError::Busy)
    }

    /// Run the plan of `request`.
    pub async fn run(&self, request: LifecycleRequest) -> MachinedResult<PipelineMetrics> {
        let pipeline = get_execution_plan(&request);
        self.run_pipeline(request.sequence(), pipeline).await
    }

    /// Run an arbitrary pipeline under the lifecycle lock.
    pub async fn run_pipeline(
        &self,
        sequence: Sequence,
        pipeline: Pipeline<Runtime>,
    ) -> MachinedResult<PipelineMetrics> {
        let _guard = self.acquire_lock().inspect_err(|_| {
            debug!(%sequence, "Another sequence is running");
        })?;

        info!(%sequence, phases = pipeline.len(), "Sequence started");
        match PipelineExecutor::execute(pipeline, self.runtime.clone(), self.runtime.mode()).await {
            Ok(metrics) => {
                log_metrics(sequence, &metrics);
                info!(%sequence, duration_ms = metrics.total_duration_ms, "Sequence finished");
                Ok(metrics)
            }
            Err(e) => {
                error!(%sequence, error = %e, "Sequence failed");
                Err(e)
            }
        }
    }

    /// Entry point for external callers: a busy lifecycle is reported as a
    /// precondition failure.
    pub async fn handle(&self, request: LifecycleRequest) -> MachinedResult<()> {
        self.run(request)
            .await
            .map(|_| ())
            .map_err(MachinedError::into_precondition)
    }

    pub async fn initialize(&self) -> MachinedResult<()> {
        self.run(LifecycleRequest::Initialize).await.map(|_| ())
    }

    pub async fn install(&self) -> MachinedResult<()> {
        self.run(LifecycleRequest::Install).await.map(|_| ())
    }

    pub async fn boot(&self) -> MachinedResult<()> {
        self.run(LifecycleRequest::Boot).await.map(|_| ())
    }

    pub async fn shutdown(&self) -> MachinedResult<()> {
        self.run(LifecycleRequest::Shutdown).await.map(|_| ())
    }

    pub async fn upgrade(&self, options: UpgradeOptions) -> MachinedResult<()> {
        self.run(LifecycleRequest::Upgrade(options)).await.map(|_| ())
    }

    pub async fn reset(&self, options: ResetOptions) -> MachinedResult<()> {
        self.run(LifecycleRequest::Reset(options)).await.map(|_| ())
    }
}

fn log_metrics(sequence: Sequence, metrics: &PipelineMetrics) {
    for phase in &metrics.phases {
        debug!(
            %sequence,
            mode = %metrics.mode,
            phase = %phase.description,
            duration_ms = phase.duration_ms,
            critical = ?phase.critical_task(),
            skipped = ?phase.skipped(),
            "Phase metrics"
        );
    }
}
