//! Types shared between machined crates.

pub mod errors;

pub use errors::{MachinedError, MachinedResult, MultiError};
