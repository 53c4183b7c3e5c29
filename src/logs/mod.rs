//! Worker log plumbing: the per-instance writer and the deduplicating tail
//! the supervisor reads from.

pub mod tail;
pub mod writer;

pub use tail::LogTail;
pub use writer::StreamLogger;

pub use crate::cloud::LogEvent;
