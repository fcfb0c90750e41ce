//! Machine lifecycle core.
//!
//! Boots a read-only image and drives the node through its lifecycle
//! (boot, upgrade, reset, shutdown) as ordered phases of concurrent tasks.
//!
//! - [`sequencer`]: lifecycle plans and the one-at-a-time [`sequencer::Sequencer`]
//! - [`pipeline`]: phase execution, error aggregation, task panics
//! - [`mount`]: mount points, ordered sets, switch-root
//! - [`installer`]: partitioning, A/B boot assets, syslinux
//! - [`adv`] and [`meta`]: bootloader ADV and the META key/value store
//! - [`kmsg`], [`kspp`], [`events`]: kernel log, hardening, event bus

pub mod adv;
pub mod blockdev;
pub mod cmdline;
pub mod config;
pub mod constants;
pub mod events;
pub mod installer;
pub mod kmsg;
pub mod kspp;
pub mod logging;
pub mod meta;
pub mod mount;
pub mod pipeline;
pub mod resources;
pub mod runtime;
pub mod sequencer;
pub mod util;

pub use machined_shared::{MachinedError, MachinedResult};
