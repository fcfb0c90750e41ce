//! Mount points, ordered mount sets and the operations over them.
//!
//! A [`Point`] describes one mount. [`Points`] keeps them in insertion
//! order: sets mount forward and unmount in reverse.

pub mod loopdev;
pub mod manager;
pub mod point;
pub mod points;
pub mod sets;
pub mod switch_root;
pub mod table;
pub mod unmount;

pub use manager::{bind_file, mount_all, move_all, unmount_all};
pub use point::{Hook, MountOutcome, Point, PointFlags};
pub use points::Points;
pub use unmount::safe_unmount;
