//! In-memory, watchable resource state.
//!
//! Components publish what they observe (volumes, META keys) as typed
//! resources; others read or watch them. Each kind lives in its own
//! [`Collection`].

mod collection;

pub use collection::{Collection, Resource, ResourceEvent};

use machined_shared::{MachinedError, MachinedResult};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

/// One META tag mirrored as a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetaKey {
    pub id: String,
    pub value: String,
}

impl MetaKey {
    /// Resource ID of `tag`: two-digit hex.
    pub fn id_for(tag: u8) -> String {
        format!("0x{:02x}", tag)
    }

    pub fn new(tag: u8, value: impl Into<String>) -> Self {
        Self {
            id: Self::id_for(tag),
            value: value.into(),
        }
    }

    /// Tag number encoded in the ID.
    pub fn tag(&self) -> Option<u8> {
        u8::from_str_radix(self.id.strip_prefix("0x")?, 16).ok()
    }
}

impl Resource for MetaKey {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VolumePhase {
    Waiting,
    Ready,
    Missing,
    Closed,
    Failed,
}

/// Discovered state of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeStatus {
    pub id: String,
    pub phase: VolumePhase,
    /// Partition device path.
    pub location: String,
    /// Device holding the partition, empty when unknown.
    pub parent_location: String,
}

impl Resource for VolumeStatus {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Volume ID of the META partition.
pub const META_VOLUME_ID: &str = "META";

/// Process-wide resource state.
#[derive(Debug, Default)]
pub struct State {
    pub meta_keys: Collection<MetaKey>,
    pub volumes: Collection<VolumeStatus>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until volume `id` exists and is in one of `phases`.
    pub async fn wait_for_volume_phase(
        &self,
        id: &str,
        phases: &[VolumePhase],
    ) -> MachinedResult<VolumeStatus> {
        let mut events = self.volumes.watch();

        if let Some(volume) = self.volumes.get(id)
            && phases.contains(&volume.phase)
        {
            return Ok(volume);
        }

        loop {
            match events.recv().await {
                Ok(ResourceEvent::Created(volume) | ResourceEvent::Updated(volume))
                    if volume.id == id && phases.contains(&volume.phase) =>
                {
                    return Ok(volume);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if let Some(volume) = self.volumes.get(id)
                        && phases.contains(&volume.phase)
                    {
                        return Ok(volume);
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(MachinedError::Internal(
                        "volume watch closed".to_string(),
                    ));
                }
            }
        }
    }
}
