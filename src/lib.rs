//! Batch rendering across a fleet of preemptible instances.
//!
//! Workers race for frames through a key-value-store backed queue, a single
//! supervisor watches the fleet and tails worker logs, and the job
//! orchestrator ties launch, supervision, result download and teardown
//! together.

pub mod cloud;
pub mod config;
pub mod error;
pub mod fleet;
pub mod format;
pub mod job;
pub mod local;
pub mod logs;
pub mod queue;
pub mod render;
