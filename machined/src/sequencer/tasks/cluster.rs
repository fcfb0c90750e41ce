//! Tasks: leaving and joining the cluster.

use super::Ctx;
use crate::constants::timeouts;
use crate::pipeline::PhaseTask;
use crate::util::retry::{Retry, expected};
use async_trait::async_trait;
use machined_shared::MachinedResult;
use tracing::{debug, info};

pub struct CordonAndDrain;

#[async_trait]
impl PhaseTask<Ctx> for CordonAndDrain {
    fn name(&self) -> &str {
        "cordon_and_drain"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        ctx.cluster().cordon_and_drain().await
    }
}

/// Removes this control plane node from etcd unless its data is preserved.
pub struct LeaveEtcd {
    pub preserve: bool,
}

#[async_trait]
impl PhaseTask<Ctx> for LeaveEtcd {
    fn name(&self) -> &str {
        "leave_etcd"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        if !ctx.is_control_plane() {
            return Ok(());
        }
        if self.preserve {
            info!("Preserving etcd membership");
            return Ok(());
        }
        ctx.cluster().leave_etcd(self.preserve).await
    }
}

pub struct RemoveAllPods;

#[async_trait]
impl PhaseTask<Ctx> for RemoveAllPods {
    fn name(&self) -> &str {
        "remove_all_pods"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        ctx.cluster().remove_all_pods().await
    }
}

pub struct LabelNodeAsMaster;

#[async_trait]
impl PhaseTask<Ctx> for LabelNodeAsMaster {
    fn name(&self) -> &str {
        "label_node_as_master"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        if !ctx.is_control_plane() {
            debug!("Worker node, not labeling");
            return Ok(());
        }

        // The API server comes up asynchronously after stage 2.
        let cluster = ctx.cluster().clone();
        Retry::constant(timeouts::LABEL_MASTER, timeouts::LABEL_MASTER_INTERVAL)
            .retry_async(move || {
                let cluster = cluster.clone();
                async move { cluster.label_node_as_master().await.map_err(expected) }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdline::Cmdline;
    use crate::config::{InstallConfig, MachineConfig, MachineSection, MachineType};
    use crate::runtime::{ClusterOperations, Collaborators, Container, Runtime};
    use machined_shared::MachinedError;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        label_failures: AtomicUsize,
    }

    #[async_trait]
    impl ClusterOperations for Recorder {
        async fn cordon_and_drain(&self) -> MachinedResult<()> {
            self.calls.lock().push("cordon".into());
            Ok(())
        }

        async fn leave_etcd(&self, preserve: bool) -> MachinedResult<()> {
            self.calls.lock().push(format!("leave:{}", preserve));
            Ok(())
        }

        async fn remove_all_pods(&self) -> MachinedResult<()> {
            self.calls.lock().push("remove".into());
            Ok(())
        }

        async fn label_node_as_master(&self) -> MachinedResult<()> {
            self.calls.lock().push("label".into());
            if self.label_failures.load(Ordering::SeqCst) > 0 {
                self.label_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(MachinedError::Internal("apiserver not ready".into()));
            }
            Ok(())
        }
    }

    fn runtime(cluster: Arc<Recorder>, machine_type: MachineType) -> Runtime {
        let runtime = Runtime::builder(Arc::new(Container), Cmdline::parse(""))
            .collaborators(Collaborators {
                cluster,
                ..Collaborators::default()
            })
            .build();
        runtime.set_config(MachineConfig {
            debug: false,
            persist: false,
            machine: MachineSection {
                machine_type,
                install: InstallConfig::default(),
                disks: Vec::new(),
                env: Default::default(),
                files: Vec::new(),
                sysctls: Default::default(),
            },
        });
        runtime
    }

    #[tokio::test]
    async fn test_leave_etcd_only_for_control_plane() {
        let cluster = Arc::new(Recorder::default());

        let worker = runtime(cluster.clone(), MachineType::Worker);
        Box::new(LeaveEtcd { preserve: false }).run(worker).await.unwrap();
        assert!(cluster.calls.lock().is_empty());

        let master = runtime(cluster.clone(), MachineType::ControlPlane);
        Box::new(LeaveEtcd { preserve: true })
            .run(master.clone())
            .await
            .unwrap();
        assert!(cluster.calls.lock().is_empty());

        Box::new(LeaveEtcd { preserve: false }).run(master).await.unwrap();
        assert_eq!(cluster.calls.lock().as_slice(), ["leave:false".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_label_master_retries() {
        let cluster = Arc::new(Recorder {
            label_failures: AtomicUsize::new(2),
            ..Recorder::default()
        });
        let master = runtime(cluster.clone(), MachineType::ControlPlane);

        Box::new(LabelNodeAsMaster).run(master).await.unwrap();
        assert_eq!(cluster.calls.lock().len(), 3);
    }
}
