//! Kernel log (`/dev/kmsg`) writer and reader.

pub mod reader;
pub mod writer;

pub use reader::{Message, Reader, ReaderOptions, boot_time, parse_record};
pub use writer::{KmsgWriter, MAX_LINE_LENGTH};
