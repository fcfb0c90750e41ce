//! Block device and partition helpers.

pub mod device;
pub mod gpt;
pub mod partition;
pub mod probe;

pub use device::{BlockDevice, lock};
pub use gpt::{PartitionEntry, PartitionTable};
pub use partition::partition_path;
pub use probe::{FilesystemKind, Prober, Superblock, probe_filesystem};
