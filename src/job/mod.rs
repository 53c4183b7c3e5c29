//! Job-level plumbing: naming, settings, worker bootstrap data, the
//! orchestrator that runs a whole job, and the leftover sweep.

pub mod bootstrap;
pub mod cleanup;
pub mod names;
pub mod orchestrator;
pub mod settings;

pub use bootstrap::{StartJob, WorkerBootstrap};
pub use cleanup::{CleanupReport, after_failure, clean_up};
pub use names::{RESOURCE_PREFIX, ResourceNames};
pub use orchestrator::{Confirmation, JobOutcome, JobReport, RenderJob};
pub use settings::{FrameSelection, JobArgs, JobSettings};
