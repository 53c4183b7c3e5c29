//! Frame queue: lock-free distribution of frames to competing workers.

pub mod frames;

pub use frames::{FrameQueue, MAX_TIER};
